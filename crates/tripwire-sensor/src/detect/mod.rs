//! Request classification.
//!
//! [`Classifier::classify`] turns a [`RequestDescriptor`] into zero or one
//! [`Detection`]. Rules are plain substring and threshold checks evaluated in
//! a fixed precedence order; the first match wins:
//!
//! 1. reconnaissance (sensitive path)
//! 2. SQL injection (credential field)
//! 3. cross-site scripting (reflected parameter)
//! 4. malicious upload (file extension)
//! 5. path traversal (file parameter)
//! 6. object-reference enumeration (numeric id over threshold)
//! 7. denial of service (request burst, once per address per window)
//! 8. not-found probe (no route matched)
//!
//! Every request is counted towards the burst window before the rules run.

mod window;

pub use window::RequestWindow;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tripwire_core::AttackCategory;

/// Rule tables and thresholds.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Path substrings that indicate scanning (case-sensitive).
    pub sensitive_paths: Vec<String>,

    /// Input fields checked for SQL metacharacters.
    pub sqli_fields: Vec<String>,
    pub sqli_markers: Vec<String>,

    /// Parameters that are reflected into pages.
    pub xss_params: Vec<String>,
    pub xss_markers: Vec<String>,

    /// Upload file extensions that are never accepted.
    pub upload_denylist: Vec<String>,

    /// Parameters naming a file to read.
    pub file_params: Vec<String>,
    pub traversal_markers: Vec<String>,

    /// Path prefix followed by a numeric object id.
    pub id_path_prefix: String,
    pub id_threshold: u64,

    /// More than this many requests per window from one address is a burst.
    pub dos_threshold: u64,
    pub dos_window: Duration,

    /// Bound on the number of addresses counted per window.
    pub max_tracked_addresses: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sensitive_paths: strings(&[
                "/admin",
                "/.git",
                "/.env",
                "/config",
                "/backup",
                "/phpinfo.php",
            ]),
            sqli_fields: strings(&["username"]),
            sqli_markers: strings(&["'", "\"", "OR 1=1", "UNION SELECT", "DROP TABLE", "--", "/*"]),
            xss_params: strings(&["name"]),
            xss_markers: strings(&[
                "<script",
                "javascript:",
                "onerror",
                "onload",
                "onclick",
                "onmouseover",
            ]),
            upload_denylist: strings(&[".php", ".exe", ".sh", ".bat", ".jsp", ".asp"]),
            file_params: strings(&["file"]),
            traversal_markers: strings(&["..", "/etc/", "/proc/", "/root/", "passwd", "shadow"]),
            id_path_prefix: "/api/user/".to_string(),
            id_threshold: 1000,
            dos_threshold: 100,
            dos_window: Duration::from_secs(60),
            max_tracked_addresses: 100_000,
        }
    }
}

/// Metadata of a file part in a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Form field the file was sent under.
    pub field: String,
    /// Client-supplied file name.
    pub file_name: String,
}

/// Everything the classifier looks at, extracted from one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Query parameters and body-derived form fields (body wins on conflict).
    pub params: HashMap<String, String>,
    pub user_agent: Option<String>,
    /// Normalized client address.
    pub client_ip: IpAddr,
    pub uploads: Vec<UploadedFile>,
    /// Whether the application had a route for this request.
    pub route_matched: bool,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>, client_ip: IpAddr) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: None,
            params: HashMap::new(),
            user_agent: None,
            client_ip,
            uploads: Vec::new(),
            route_matched: true,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_upload(mut self, field: impl Into<String>, file_name: impl Into<String>) -> Self {
        self.uploads.push(UploadedFile {
            field: field.into(),
            file_name: file_name.into(),
        });
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn unmatched(mut self) -> Self {
        self.route_matched = false;
        self
    }

    /// Path plus query string, as recorded in the event log.
    pub fn url(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

/// A matched rule and its evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub category: AttackCategory,
    pub details: String,
}

impl Detection {
    fn new(category: AttackCategory, details: String) -> Self {
        Self { category, details }
    }
}

/// Rule engine plus the burst window it owns.
#[derive(Debug)]
pub struct Classifier {
    config: DetectionConfig,
    // Lowercased copies of the case-insensitive tables.
    sqli_markers: Vec<String>,
    xss_markers: Vec<String>,
    upload_denylist: Vec<String>,
    window: RequestWindow,
}

fn lowercase_all(items: &[String]) -> Vec<String> {
    items.iter().map(|s| s.to_lowercase()).collect()
}

/// `username` -> `Username`
fn field_label(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lenient integer parse like a JavaScript `parseInt`: leading whitespace and
/// an optional sign, then the leading digits.
fn leading_number(s: &str) -> Option<u64> {
    let s = s.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    let digits = &s[..end];
    // Negative ids are below any threshold.
    if digits.is_empty() || negative {
        return None;
    }
    // Only overflow can fail here; treat it as "very large".
    Some(digits.parse().unwrap_or(u64::MAX))
}

impl Classifier {
    pub fn new(config: DetectionConfig) -> Self {
        let window = RequestWindow::new(
            config.dos_window,
            config.max_tracked_addresses,
            Instant::now(),
        );
        Self {
            sqli_markers: lowercase_all(&config.sqli_markers),
            xss_markers: lowercase_all(&config.xss_markers),
            upload_denylist: lowercase_all(&config.upload_denylist),
            window,
            config,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Addresses counted in the current burst window.
    pub fn tracked_addresses(&self) -> usize {
        self.window.tracked()
    }

    /// Classify a request against the wall clock.
    pub fn classify(&self, req: &RequestDescriptor) -> Option<Detection> {
        self.classify_at(req, Instant::now())
    }

    /// Classify a request at an explicit instant.
    pub fn classify_at(&self, req: &RequestDescriptor, now: Instant) -> Option<Detection> {
        let count = self.window.observe(req.client_ip, now);

        self.reconnaissance(req)
            .or_else(|| self.sql_injection(req))
            .or_else(|| self.cross_site_scripting(req))
            .or_else(|| self.malicious_upload(req))
            .or_else(|| self.path_traversal(req))
            .or_else(|| self.object_enumeration(req))
            .or_else(|| self.denial_of_service(req, count))
            .or_else(|| self.not_found(req))
    }

    fn reconnaissance(&self, req: &RequestDescriptor) -> Option<Detection> {
        self.config
            .sensitive_paths
            .iter()
            .any(|p| req.path.contains(p.as_str()))
            .then(|| {
                Detection::new(AttackCategory::Reconnaissance, format!("Path: {}", req.path))
            })
    }

    fn sql_injection(&self, req: &RequestDescriptor) -> Option<Detection> {
        self.config.sqli_fields.iter().find_map(|field| {
            let value = req.params.get(field)?;
            let lowered = value.to_lowercase();
            self.sqli_markers
                .iter()
                .any(|m| lowered.contains(m.as_str()))
                .then(|| {
                    Detection::new(
                        AttackCategory::SqlInjection,
                        format!("{}: {}", field_label(field), value),
                    )
                })
        })
    }

    fn cross_site_scripting(&self, req: &RequestDescriptor) -> Option<Detection> {
        self.config.xss_params.iter().find_map(|param| {
            let value = req.params.get(param)?;
            let lowered = value.to_lowercase();
            self.xss_markers
                .iter()
                .any(|m| lowered.contains(m.as_str()))
                .then(|| {
                    Detection::new(
                        AttackCategory::CrossSiteScripting,
                        format!("Payload: {}", value),
                    )
                })
        })
    }

    fn malicious_upload(&self, req: &RequestDescriptor) -> Option<Detection> {
        req.uploads.iter().find_map(|upload| {
            let lowered = upload.file_name.to_lowercase();
            self.upload_denylist
                .iter()
                .any(|ext| lowered.ends_with(ext.as_str()))
                .then(|| {
                    Detection::new(
                        AttackCategory::MaliciousUpload,
                        format!("File: {}", upload.file_name),
                    )
                })
        })
    }

    fn path_traversal(&self, req: &RequestDescriptor) -> Option<Detection> {
        self.config.file_params.iter().find_map(|param| {
            let value = req.params.get(param)?;
            self.config
                .traversal_markers
                .iter()
                .any(|m| value.contains(m.as_str()))
                .then(|| {
                    Detection::new(
                        AttackCategory::PathTraversal,
                        format!("Attempted file: {}", value),
                    )
                })
        })
    }

    fn object_enumeration(&self, req: &RequestDescriptor) -> Option<Detection> {
        let rest = req.path.strip_prefix(self.config.id_path_prefix.as_str())?;
        let id = rest.split('/').next().unwrap_or_default();
        let number = leading_number(id)?;
        (number > self.config.id_threshold).then(|| {
            Detection::new(AttackCategory::ObjectEnumeration, format!("User ID: {}", id))
        })
    }

    fn denial_of_service(&self, req: &RequestDescriptor, count: u64) -> Option<Detection> {
        if count <= self.config.dos_threshold || !self.window.claim_report(req.client_ip) {
            return None;
        }
        Some(Detection::new(
            AttackCategory::DenialOfService,
            format!(
                "{} requests in {} seconds",
                count,
                self.window.window().as_secs()
            ),
        ))
    }

    fn not_found(&self, req: &RequestDescriptor) -> Option<Detection> {
        (!req.route_matched)
            .then(|| Detection::new(AttackCategory::NotFound, format!("Path: {}", req.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    fn classifier() -> Classifier {
        Classifier::new(DetectionConfig::default())
    }

    fn get(path: &str) -> RequestDescriptor {
        RequestDescriptor::new("GET", path, CLIENT)
    }

    fn category(c: &Classifier, req: &RequestDescriptor) -> Option<AttackCategory> {
        c.classify(req).map(|d| d.category)
    }

    #[test]
    fn test_benign_request() {
        let c = classifier();
        assert_eq!(c.classify(&get("/")), None);
        assert_eq!(
            c.classify(&get("/settings").with_param("name", "alice")),
            None
        );
    }

    #[test]
    fn test_reconnaissance() {
        let c = classifier();
        let d = c.classify(&get("/.env").unmatched()).unwrap();
        assert_eq!(d.category, AttackCategory::Reconnaissance);
        assert_eq!(d.details, "Path: /.env");
        assert_eq!(
            category(&c, &get("/wp/admin/login")),
            Some(AttackCategory::Reconnaissance)
        );
    }

    #[test]
    fn test_sql_injection_reports_literal_username() {
        let c = classifier();
        for username in ["' OR 1=1 --", "admin' OR 1=1 --", "x' or 1=1 --"] {
            let req =
                RequestDescriptor::new("POST", "/login", CLIENT).with_param("username", username);
            let d = c.classify(&req).unwrap();
            assert_eq!(d.category, AttackCategory::SqlInjection);
            assert!(d.details.contains(username));
            assert_eq!(d.details, format!("Username: {}", username));
        }
    }

    #[test]
    fn test_sql_keywords_case_insensitive() {
        let c = classifier();
        let req = RequestDescriptor::new("POST", "/login", CLIENT)
            .with_param("username", "x union select password from users");
        assert_eq!(category(&c, &req), Some(AttackCategory::SqlInjection));

        // Only configured fields are checked.
        let req = RequestDescriptor::new("POST", "/login", CLIENT)
            .with_param("password", "' OR 1=1 --");
        assert_eq!(category(&c, &req), None);
    }

    #[test]
    fn test_xss() {
        let c = classifier();
        for payload in [
            "<script>alert(1)</script>",
            "<SCRIPT src=x>",
            "JavaScript:alert(1)",
            "<img src=x onerror=alert(1)>",
        ] {
            let d = c.classify(&get("/settings").with_param("name", payload)).unwrap();
            assert_eq!(d.category, AttackCategory::CrossSiteScripting);
            assert_eq!(d.details, format!("Payload: {}", payload));
        }
    }

    #[test]
    fn test_malicious_upload_any_case_once() {
        let c = classifier();
        for name in ["shell.php", "SHELL.PHP", "run.Exe", "x.sh", "a.BaT", "b.jsp", "c.AsP"] {
            let req = RequestDescriptor::new("POST", "/upload", CLIENT).with_upload("avatar", name);
            let d = c.classify(&req).unwrap();
            assert_eq!(d.category, AttackCategory::MaliciousUpload);
            assert_eq!(d.details, format!("File: {}", name));
        }

        // Several bad files still yield a single detection naming the first.
        let req = RequestDescriptor::new("POST", "/upload", CLIENT)
            .with_upload("a", "one.php")
            .with_upload("b", "two.exe");
        assert_eq!(c.classify(&req).unwrap().details, "File: one.php");

        let req = RequestDescriptor::new("POST", "/upload", CLIENT).with_upload("avatar", "me.png");
        assert_eq!(c.classify(&req), None);
        let req =
            RequestDescriptor::new("POST", "/upload", CLIENT).with_upload("avatar", "php.png");
        assert_eq!(c.classify(&req), None);
    }

    #[test]
    fn test_path_traversal() {
        let c = classifier();
        for file in ["../../secret", "/etc/hosts", "passwd", "/proc/self/environ"] {
            let d = c.classify(&get("/download").with_param("file", file)).unwrap();
            assert_eq!(d.category, AttackCategory::PathTraversal);
            assert_eq!(d.details, format!("Attempted file: {}", file));
        }
        assert_eq!(
            c.classify(&get("/download").with_param("file", "statement.pdf")),
            None
        );
    }

    #[test]
    fn test_object_enumeration() {
        let c = classifier();
        let d = c.classify(&get("/api/user/1001")).unwrap();
        assert_eq!(d.category, AttackCategory::ObjectEnumeration);
        assert_eq!(d.details, "User ID: 1001");

        assert_eq!(c.classify(&get("/api/user/1000")), None);
        assert_eq!(c.classify(&get("/api/user/1")), None);
        assert_eq!(c.classify(&get("/api/user/abc")), None);
        assert_eq!(
            category(&c, &get("/api/user/5000abc")),
            Some(AttackCategory::ObjectEnumeration)
        );
        assert_eq!(
            category(&c, &get("/api/user/99999999999999999999999")),
            Some(AttackCategory::ObjectEnumeration)
        );

        let d = c.classify(&get("/api/user/+1001")).unwrap();
        assert_eq!(d.category, AttackCategory::ObjectEnumeration);
        assert_eq!(d.details, "User ID: +1001");
        assert_eq!(c.classify(&get("/api/user/-5000")), None);
    }

    #[test]
    fn test_not_found_is_fallback() {
        let c = classifier();
        let d = c.classify(&get("/nothing-here").unmatched()).unwrap();
        assert_eq!(d.category, AttackCategory::NotFound);
        assert_eq!(d.details, "Path: /nothing-here");
    }

    #[test]
    fn test_precedence() {
        let c = classifier();
        // Recon beats everything else.
        let req = get("/admin")
            .with_param("username", "' OR 1=1 --")
            .with_param("name", "<script>")
            .unmatched();
        assert_eq!(category(&c, &req), Some(AttackCategory::Reconnaissance));

        // SQLi beats XSS.
        let req = get("/login")
            .with_param("username", "' OR 1=1 --")
            .with_param("name", "<script>");
        assert_eq!(category(&c, &req), Some(AttackCategory::SqlInjection));

        // Upload beats traversal.
        let req = get("/upload")
            .with_param("file", "../x")
            .with_upload("f", "x.php");
        assert_eq!(category(&c, &req), Some(AttackCategory::MaliciousUpload));

        // Anything specific beats not-found.
        let req = get("/api/user/2000").unmatched();
        assert_eq!(category(&c, &req), Some(AttackCategory::ObjectEnumeration));
    }

    #[test]
    fn test_burst_reported_once_per_window() {
        let c = classifier();
        let t0 = Instant::now();
        let req = get("/");

        let detections: Vec<Detection> = (0..101)
            .filter_map(|_| c.classify_at(&req, t0))
            .collect();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].category, AttackCategory::DenialOfService);
        assert_eq!(detections[0].details, "101 requests in 60 seconds");

        // Keeps quiet for the rest of the window.
        for _ in 0..50 {
            assert_eq!(c.classify_at(&req, t0 + Duration::from_secs(30)), None);
        }

        // A new window needs a new burst.
        let next = t0 + Duration::from_secs(61);
        assert_eq!(c.classify_at(&req, next), None);
    }

    #[test]
    fn test_burst_not_lost_behind_higher_rule() {
        let c = classifier();
        let t0 = Instant::now();
        for _ in 0..100 {
            c.classify_at(&get("/"), t0);
        }
        // The 101st request is a recon hit; the 102nd still reports the burst.
        assert_eq!(
            c.classify_at(&get("/.git/config"), t0).map(|d| d.category),
            Some(AttackCategory::Reconnaissance)
        );
        let d = c.classify_at(&get("/"), t0).unwrap();
        assert_eq!(d.category, AttackCategory::DenialOfService);
        assert_eq!(d.details, "102 requests in 60 seconds");
    }

    #[test]
    fn test_burst_is_per_address() {
        let c = classifier();
        let t0 = Instant::now();
        let other = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8));
        for _ in 0..100 {
            assert_eq!(c.classify_at(&get("/"), t0), None);
            assert_eq!(
                c.classify_at(&RequestDescriptor::new("GET", "/", other), t0),
                None
            );
        }
        assert_eq!(c.tracked_addresses(), 2);
    }

    #[test]
    fn test_url_includes_query() {
        let mut req = get("/download");
        assert_eq!(req.url(), "/download");
        req.query = Some("file=a.pdf".to_string());
        assert_eq!(req.url(), "/download?file=a.pdf");
    }

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number("1001"), Some(1001));
        assert_eq!(leading_number("12ab"), Some(12));
        assert_eq!(leading_number("ab12"), None);
        assert_eq!(leading_number(""), None);
        assert_eq!(leading_number("+1001"), Some(1001));
        assert_eq!(leading_number("  1001"), Some(1001));
        assert_eq!(leading_number("-1001"), None);
        assert_eq!(leading_number("+"), None);
    }
}
