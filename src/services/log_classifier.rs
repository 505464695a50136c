use std::sync::OnceLock;

use regex::Regex;

use crate::models::AuthPrompt;

/// Inspects one console line at a time.
pub trait LineClassifier: Send + Sync {
    fn classify(&self, line: &str) -> Option<AuthPrompt>;
}

/// Recognizes the server's "log in on another device" prompts.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceAuthClassifier;

fn verify_url_re() -> &'static Regex {
    static VERIFY_URL_RE: OnceLock<Regex> = OnceLock::new();
    VERIFY_URL_RE.get_or_init(|| {
        Regex::new(r"https?://[^\s]*device/verify[^\s]*").expect("valid verify url pattern")
    })
}

fn user_code_re() -> &'static Regex {
    static USER_CODE_RE: OnceLock<Regex> = OnceLock::new();
    USER_CODE_RE.get_or_init(|| {
        Regex::new(r"(?i)(?:user_code=|code[:\s]+)([A-Z0-9]{4}-?[A-Z0-9]{4})")
            .expect("valid user code pattern")
    })
}

impl LineClassifier for DeviceAuthClassifier {
    fn classify(&self, line: &str) -> Option<AuthPrompt> {
        let url = verify_url_re()
            .find(line)
            .map(|found| found.as_str().trim_end_matches(['.', ',', ')']).to_string());
        if url.is_none() && !line.contains("device/verify") {
            return None;
        }
        let code = user_code_re()
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|found| found.as_str().to_ascii_uppercase());

        Some(AuthPrompt {
            raw_line: line.to_string(),
            code,
            url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinary_lines_are_ignored() {
        let classifier = DeviceAuthClassifier;
        assert!(classifier.classify("[INFO] Loading world...").is_none());
        assert!(classifier.classify("code: ABCD-EFGH").is_none());
    }

    #[test]
    fn extracts_url_and_code_from_prefilled_link() {
        let prompt = DeviceAuthClassifier
            .classify("Visit https://oauth.accounts.hytale.com/oauth2/device/verify?user_code=abcd-efgh to log in.")
            .expect("prompt");
        assert_eq!(
            prompt.url.as_deref(),
            Some("https://oauth.accounts.hytale.com/oauth2/device/verify?user_code=abcd-efgh")
        );
        assert_eq!(prompt.code.as_deref(), Some("ABCD-EFGH"));
    }

    #[test]
    fn separate_code_and_bare_marker_still_match() {
        let prompt = DeviceAuthClassifier
            .classify("Go to https://accounts.example/device/verify and enter code: WXYZ1234")
            .expect("prompt");
        assert_eq!(prompt.url.as_deref(), Some("https://accounts.example/device/verify"));
        assert_eq!(prompt.code.as_deref(), Some("WXYZ1234"));

        let bare = DeviceAuthClassifier
            .classify("open device/verify in your browser")
            .expect("bare prompt");
        assert_eq!(bare.url, None);
        assert_eq!(bare.raw_line, "open device/verify in your browser");
    }
}
