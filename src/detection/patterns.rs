//! Content rule sets shared by the listeners: token lists for injection and
//! traversal probes, scanner fingerprints, and the mail spam heuristics.
//!
//! Matching is case-insensitive substring search over the raw input plus a
//! percent-decoded copy, so encoded probes (`..%2f`, `%27%20OR`) are caught
//! without a full URL parser.

/// Paths attackers enumerate on every host they touch.
pub const SUSPICIOUS_ENDPOINTS: &[&str] = &[
    "/admin",
    "/wp-admin",
    "/wp-login.php",
    "/xmlrpc.php",
    "/.git",
    "/.env",
    "/.aws",
    "/.ssh",
    "/phpmyadmin",
    "/config.php",
    "/backup",
    "/cgi-bin",
    "/actuator",
    "/manager/html",
    "/console",
    "/shell",
    "/vendor/phpunit",
    "/id_rsa",
];

pub const SQLI_TOKENS: &[&str] = &[
    "union select",
    "union all select",
    "or 1=1",
    "' or '",
    "\" or \"",
    "1=1--",
    "information_schema",
    "sleep(",
    "benchmark(",
    "into outfile",
    "load_file",
    "drop table",
    "waitfor delay",
    "@@version",
    "xp_cmdshell",
];

pub const COMMAND_TOKENS: &[&str] = &[
    "; ls",
    "| ls",
    "&& ls",
    "; cat ",
    "| cat ",
    "; wget",
    "| wget",
    "&& wget",
    "; curl",
    "&& curl",
    "; rm -rf",
    "| nc ",
    "$(",
    "`id`",
    "/bin/sh",
    "/bin/bash",
    "chmod 777",
    "chmod +x",
];

pub const XSS_TOKENS: &[&str] = &[
    "<script",
    "javascript:",
    "onerror=",
    "onload=",
    "alert(",
    "document.cookie",
    "<svg",
    "<img src",
    "string.fromcharcode",
];

pub const TRAVERSAL_TOKENS: &[&str] = &[
    "../",
    "..\\",
    "..%2f",
    "..%5c",
    "%2e%2e%2f",
    "....//",
];

/// User-agent substrings of well-known scanners.
pub const SCANNER_AGENTS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "zgrab",
    "gobuster",
    "dirbuster",
    "dirb",
    "wpscan",
    "wfuzz",
    "acunetix",
    "nessus",
];

/// SSH client identification strings used by scanning and bruteforce tools.
pub const SSH_SCANNER_IDENTS: &[&str] = &[
    "libssh",
    "paramiko",
    "zgrab",
    "nmap",
    "masscan",
    "hydra",
    "medusa",
    "go",
];

pub const SPAM_PHRASES: &[&str] = &[
    "viagra",
    "cialis",
    "free money",
    "click here now",
    "limited time offer",
    "act now",
    "you are a winner",
    "lottery",
    "unclaimed funds",
    "make money fast",
    "100% free",
    "weight loss",
    "casino bonus",
    "work from home",
    "earn extra cash",
];

const HIDDEN_CONTENT_CSS: &[&str] = &[
    "display:none",
    "display: none",
    "visibility:hidden",
    "visibility: hidden",
    "font-size:0",
    "opacity:0",
];

/// Spam verdict threshold on embedded links.
const SPAM_URL_LIMIT: usize = 10;

/// Decode `%XX` escapes and `+`; invalid escapes pass through untouched.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_token<'a>(haystack: &str, tokens: &[&'a str]) -> Option<&'a str> {
    let lower = haystack.to_lowercase();
    let decoded = percent_decode(&lower);
    tokens
        .iter()
        .find(|t| lower.contains(*t) || decoded.contains(*t))
        .copied()
}

pub fn match_suspicious_endpoint(path: &str) -> Option<&'static str> {
    find_token(path, SUSPICIOUS_ENDPOINTS)
}

pub fn match_sqli(text: &str) -> Option<&'static str> {
    find_token(text, SQLI_TOKENS)
}

pub fn match_command_injection(text: &str) -> Option<&'static str> {
    find_token(text, COMMAND_TOKENS)
}

pub fn match_xss(text: &str) -> Option<&'static str> {
    find_token(text, XSS_TOKENS)
}

pub fn match_traversal(text: &str) -> Option<&'static str> {
    find_token(text, TRAVERSAL_TOKENS)
}

pub fn match_scanner_agent(user_agent: &str) -> Option<&'static str> {
    find_token(user_agent, SCANNER_AGENTS)
}

/// Match an SSH identification string ("SSH-2.0-Go", "SSH-2.0-libssh2_1.4")
/// against known scanner clients. The bare `go` signature only matches as a
/// whole software token to avoid firing on e.g. "Gossh-like" vendor strings.
pub fn match_ssh_scanner(ident: &str) -> Option<&'static str> {
    let lower = ident.to_lowercase();
    let software = lower
        .strip_prefix("ssh-2.0-")
        .or_else(|| lower.strip_prefix("ssh-1.99-"))
        .unwrap_or(&lower);
    SSH_SCANNER_IDENTS.iter().copied().find(|sig| {
        if *sig == "go" {
            software == "go" || software.starts_with("go_") || software.starts_with("go-")
        } else {
            software.contains(sig)
        }
    })
}

/// Reason a DATA body was judged spam, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpamIndicator {
    ExcessiveUrls(usize),
    HiddenContent,
    Phrase(&'static str),
}

impl std::fmt::Display for SpamIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpamIndicator::ExcessiveUrls(n) => write!(f, "{n} embedded urls"),
            SpamIndicator::HiddenContent => write!(f, "hidden-content css"),
            SpamIndicator::Phrase(p) => write!(f, "spam phrase '{p}'"),
        }
    }
}

/// Content heuristic for message bodies: link stuffing, CSS-hidden content,
/// or any phrase from the spam list.
pub fn match_spam(body: &str) -> Option<SpamIndicator> {
    let lower = body.to_lowercase();
    let urls = lower.matches("http://").count() + lower.matches("https://").count();
    if urls > SPAM_URL_LIMIT {
        return Some(SpamIndicator::ExcessiveUrls(urls));
    }
    if HIDDEN_CONTENT_CSS.iter().any(|c| lower.contains(c)) {
        return Some(SpamIndicator::HiddenContent);
    }
    SPAM_PHRASES
        .iter()
        .copied()
        .find(|p| lower.contains(p))
        .map(SpamIndicator::Phrase)
}
