//! Kernel source preparation: textual parameter substitution and kernel discovery.

use std::collections::BTreeMap;

/// Identifier-to-text replacements applied to kernel source before compilation.
///
/// Only whole identifier tokens are replaced, in a single pass: `KEY_TYPE`
/// never matches inside `MY_KEY_TYPE`, and replacement text is not scanned again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Substitutions {
    entries: BTreeMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produce the substituted source text.
    pub fn apply(&self, source: &str) -> String {
        let mut out = String::with_capacity(source.len());
        let bytes = source.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if is_ident_start(bytes[i]) {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                let token = &source[start..i];
                match self.entries.get(token) {
                    Some(replacement) => out.push_str(replacement),
                    None => out.push_str(token),
                }
            } else if bytes[i].is_ascii_digit() {
                // Numeric literals such as 0x1Fu are copied whole so their
                // suffixes are never mistaken for identifiers.
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                out.push_str(&source[start..i]);
            } else {
                let ch = source[i..].chars().next().unwrap_or('\0');
                out.push(ch);
                i += ch.len_utf8().max(1);
            }
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Substitutions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut subs = Substitutions::new();
        for (k, v) in iter {
            subs.insert(k, v);
        }
        subs
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Names of all kernels declared as `kernel void NAME(` in `source`, in order.
pub fn kernel_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let code: String = source
        .lines()
        .map(|line| line.split("//").next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");
    let mut tokens = code
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .peekable();
    while let Some(token) = tokens.next() {
        if token == "kernel" && tokens.peek() == Some(&"void") {
            tokens.next();
            if let Some(name) = tokens.next() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_replaces_whole_identifiers_only() {
        let subs = Substitutions::new()
            .with("KEY_TYPE", "uint")
            .with("DATA_TYPE", "uint2");
        let src = "KEY_TYPE k; MY_KEY_TYPE m; DATA_TYPE* d; KEY_TYPE_X x;";
        assert_eq!(
            subs.apply(src),
            "uint k; MY_KEY_TYPE m; uint2* d; KEY_TYPE_X x;"
        );
    }

    #[test]
    fn test_apply_is_single_pass() {
        let subs = Substitutions::new()
            .with("SORT_KEY", "MAX_KEY")
            .with("MAX_KEY", "0xFFFFFFFFu");
        assert_eq!(subs.apply("return SORT_KEY;"), "return MAX_KEY;");
    }

    #[test]
    fn test_apply_leaves_literals_and_unicode() {
        let subs = Substitutions::new().with("u", "REPLACED");
        assert_eq!(subs.apply("x = 0x10u + u; // ±"), "x = 0x10u + REPLACED; // ±");
    }

    #[test]
    fn test_kernel_names() {
        let src = r#"
            static inline KEY_TYPE sort_key(DATA_TYPE value) { return SORT_KEY; }
            kernel void sortShortList(device DATA_TYPE* data [[buffer(0)]]) {}
            kernel  void computeRange(device const DATA_TYPE* data) {}
            // kernel void
            void helper() {}
        "#;
        assert_eq!(kernel_names(src), vec!["sortShortList", "computeRange"]);
    }

    #[test]
    fn test_from_iter() {
        let subs: Substitutions = [("A", "1"), ("B", "2")].into_iter().collect();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs.get("B"), Some("2"));
        assert_eq!(subs.apply("A+B"), "1+2");
    }
}
