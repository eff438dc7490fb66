//! Best-effort identity hints sniffed from visitor text. Not validated.

use regex::Regex;
use std::sync::LazyLock;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").expect("valid regex")
});
static MY_NAME_IS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bmy name is\s+([a-z ,.'-]{2,80})").expect("valid regex")
});

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IdentityHints {
    pub email: Option<String>,
    pub name: Option<String>,
}

impl IdentityHints {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.name.is_none()
    }
}

pub fn sniff_identity(text: &str) -> IdentityHints {
    let email = EMAIL.find(text).map(|m| m.as_str().to_string());
    let name = MY_NAME_IS
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|n| !n.is_empty());
    IdentityHints { email, name }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_email_anywhere() {
        let hints = sniff_identity("reach me at Ann.Lee+chat@Example.co.uk please");
        assert_eq!(hints.email.as_deref(), Some("Ann.Lee+chat@Example.co.uk"));
        assert_eq!(hints.name, None);
    }

    #[test]
    fn finds_name_phrase() {
        let hints = sniff_identity("Hi, My name is  Mary   Ann. I need help");
        assert_eq!(hints.name.as_deref(), Some("Mary Ann. I need help"));
    }

    #[test]
    fn name_stops_at_unsupported_characters() {
        let hints = sniff_identity("my name is Bob! and my email is bob@example.com");
        assert_eq!(hints.name.as_deref(), Some("Bob"));
        assert_eq!(hints.email.as_deref(), Some("bob@example.com"));
    }

    #[test]
    fn requires_word_boundary_and_min_length() {
        assert_eq!(sniff_identity("enemy name is Zed").name, None);
        assert_eq!(sniff_identity("my name is X").name, None);
        assert!(sniff_identity("just a question").is_empty());
    }
}
