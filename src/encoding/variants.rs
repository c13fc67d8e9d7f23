use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Variant characters as they appear in CCSID 37
pub const AMERICAN_VARIANTS: &str = "#@$";

/// Serialized form of the alphabets, as stored in the discovery cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantChars {
    pub american: String,
    pub local: String,
}

impl Default for VariantChars {
    fn default() -> Self {
        Self {
            american: AMERICAN_VARIANTS.to_string(),
            local: AMERICAN_VARIANTS.to_string(),
        }
    }
}

/// Positional mapping between the American and Local variant alphabets.
///
/// Position `i` of `american` corresponds to position `i` of `local`. The
/// name-validity pattern depends on the Local alphabet and is compiled on first
/// use after every change.
#[derive(Debug, Clone)]
pub struct VariantCharacterSet {
    american: Vec<char>,
    local: Vec<char>,
    name_pattern: OnceCell<Regex>,
}

impl Default for VariantCharacterSet {
    fn default() -> Self {
        Self::new(AMERICAN_VARIANTS)
    }
}

impl PartialEq for VariantCharacterSet {
    fn eq(&self, other: &Self) -> bool {
        self.american == other.american && self.local == other.local
    }
}

impl VariantCharacterSet {
    /// Build a set whose Local alphabet is `local`. Anything that is not
    /// exactly three characters long leaves the American alphabet in place.
    pub fn new(local: &str) -> Self {
        let american: Vec<char> = AMERICAN_VARIANTS.chars().collect();
        let local: Vec<char> = local.chars().collect();
        let local = if local.len() == american.len() {
            local
        } else {
            tracing::warn!("Ignoring malformed local variant alphabet ({} chars)", local.len());
            american.clone()
        };

        Self {
            american,
            local,
            name_pattern: OnceCell::new(),
        }
    }

    pub fn from_chars(chars: &VariantChars) -> Self {
        Self::new(&chars.local)
    }

    pub fn to_chars(&self) -> VariantChars {
        VariantChars {
            american: self.american(),
            local: self.local(),
        }
    }

    pub fn american(&self) -> String {
        self.american.iter().collect()
    }

    pub fn local(&self) -> String {
        self.local.iter().collect()
    }

    /// Replace the Local alphabet after a fresh probe
    pub fn set_local(&mut self, local: &str) {
        *self = Self::new(local);
    }

    pub fn is_identity(&self) -> bool {
        self.american == self.local
    }

    /// True when the Local alphabet contains letters with a case distinction,
    /// which makes a blind uppercase of a name unsafe.
    pub fn has_dangerous_variants(&self) -> bool {
        let local = self.local();
        local != local.to_uppercase()
    }

    /// Map American variant characters to their Local counterparts
    pub fn to_local(&self, text: &str) -> String {
        Self::substitute(text, &self.american, &self.local)
    }

    /// Map Local variant characters back to the American alphabet
    pub fn to_american(&self, text: &str) -> String {
        Self::substitute(text, &self.local, &self.american)
    }

    fn substitute(text: &str, from: &[char], to: &[char]) -> String {
        if from == to {
            return text.to_string();
        }

        text.chars()
            .map(|c| match from.iter().position(|f| *f == c) {
                Some(index) => to[index],
                None => c,
            })
            .collect()
    }

    /// Uppercase an object name without corrupting Local variant characters.
    ///
    /// When the Local alphabet is case-distinct and the name uses one of its
    /// characters, each character is uppercased on its own and the result is
    /// kept only if it is still a legal name character.
    pub fn upper_case_name(&self, name: &str) -> String {
        let uses_variant = name.chars().any(|c| self.local.contains(&c));
        if !(self.has_dangerous_variants() && uses_variant) {
            return name.to_uppercase();
        }

        name.chars()
            .map(|c| {
                let mut upper = c.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(u), None) if u.is_ascii_uppercase() || self.local.contains(&u) => u,
                    _ => c,
                }
            })
            .collect()
    }

    /// Check a system object name: at most ten characters from the legal
    /// alphabet, not starting with `_` or `.`.
    pub fn is_valid_name(&self, name: &str) -> bool {
        self.name_pattern
            .get_or_try_init(|| {
                let local = regex::escape(&self.local());
                Regex::new(&format!("^[A-Z0-9{local}][A-Z0-9_{local}.]{{0,9}}$", local = local))
            })
            .map(|pattern| pattern.is_match(name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_alphabet_is_noop() {
        let set = VariantCharacterSet::default();
        assert!(set.is_identity());
        assert_eq!(set.to_local("MY#LIB@$"), "MY#LIB@$");
        assert_eq!(set.to_american("MY#LIB@$"), "MY#LIB@$");
    }

    #[test]
    fn test_substitution_is_positional() {
        let set = VariantCharacterSet::new("£à$");
        assert_eq!(set.to_local("#LIB@"), "£LIBà");
        assert_eq!(set.to_american("£LIBà$"), "#LIB@$");
    }

    #[test]
    fn test_round_trip_on_name_characters() {
        let set = VariantCharacterSet::new("ÃÔ§");
        for name in ["ABC", "Ã12Ô", "§_X.Y", "Z9"] {
            assert_eq!(set.to_local(&set.to_american(name)), name);
        }
    }

    #[test]
    fn test_names_without_variants_unchanged() {
        let set = VariantCharacterSet::new("ÄÖÜ");
        assert_eq!(set.to_local("QGPL"), "QGPL");
        assert_eq!(set.to_american("QGPL"), "QGPL");
    }

    #[test]
    fn test_upper_case_name_dangerous_alphabet() {
        let set = VariantCharacterSet::new("£à$");
        assert!(set.has_dangerous_variants());
        assert_eq!(set.upper_case_name("àTesT£ye$"), "àTEST£YE$");
        assert_eq!(set.upper_case_name("test_cAsE"), "TEST_CASE");
    }

    #[test]
    fn test_upper_case_name_safe_alphabet() {
        let set = VariantCharacterSet::default();
        assert!(!set.has_dangerous_variants());
        assert_eq!(set.upper_case_name("@TesT#ye$"), "@TEST#YE$");
        assert_eq!(set.upper_case_name("test_cAsE"), "TEST_CASE");
    }

    #[test]
    fn test_valid_name() {
        let set = VariantCharacterSet::default();
        assert!(set.is_valid_name("QGPL"));
        assert!(set.is_valid_name("#LIB"));
        assert!(set.is_valid_name("A_B.C"));
        assert!(!set.is_valid_name("ABCDEFGHIJK"));
        assert!(!set.is_valid_name("_LIB"));
        assert!(!set.is_valid_name("lib"));
        assert!(!set.is_valid_name(""));
    }

    #[test]
    fn test_valid_name_follows_local_alphabet() {
        let mut set = VariantCharacterSet::default();
        assert!(!set.is_valid_name("£LIB"));
        set.set_local("£@$");
        assert!(set.is_valid_name("£LIB"));
        assert!(!set.is_valid_name("#LIB"));
    }

    #[test]
    fn test_malformed_local_is_ignored() {
        let set = VariantCharacterSet::new("ab");
        assert!(set.is_identity());
    }
}
