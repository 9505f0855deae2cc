//! Password strength evaluation.
//!
//! Pure function, no I/O. A fixed list of weighted requirements produces the base score;
//! adjustments for keyboard walks, dates, length and entropy are applied on top.
//! Blocking requirements and identity similarity go to `errors`; everything else is a
//! warning. `is_valid` is true iff `errors` is empty.

use serde::Serialize;

pub const MIN_LENGTH: usize = 8;
const ENTROPY_BONUS_THRESHOLD: f64 = 60.0;
const MIN_SIMILARITY_FRAGMENT: usize = 4;

const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "password12",
    "password123",
    "passw0rd",
    "p@ssw0rd",
    "p@ssword",
    "123456",
    "1234567",
    "12345678",
    "123456789",
    "1234567890",
    "111111",
    "000000",
    "qwerty",
    "qwerty123",
    "qwertyuiop",
    "1q2w3e4r",
    "abc123",
    "letmein",
    "welcome",
    "welcome1",
    "welcome123",
    "admin",
    "admin123",
    "administrator",
    "iloveyou",
    "monkey",
    "dragon",
    "football",
    "baseball",
    "sunshine",
    "princess",
    "master",
    "shadow",
    "superman",
    "trustno1",
    "changeme",
    "starwars",
    "freedom",
    "whatever",
    "login",
    "hello123",
];

const KEYBOARD_WALKS: &[&str] = &[
    "qwert", "werty", "ertyu", "asdf", "sdfg", "dfgh", "zxcv", "xcvb", "yxcv", "qwertz",
    "azerty", "1qaz", "2wsx", "3edc", "zaq1", "xsw2", "!@#$", "@#$%",
];

/// Optional identity context used for the similarity check.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserInfo<'a> {
    pub email: Option<&'a str>,
    pub name: Option<&'a str>,
    pub company_name: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordEvaluation {
    pub is_valid: bool,
    /// 0 – 100
    pub score: u8,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

struct Requirement {
    weight: u32,
    blocking: bool,
    message: &'static str,
    suggestion: &'static str,
    check: fn(&str) -> bool,
}

const REQUIREMENTS: &[Requirement] = &[
    Requirement {
        weight: 25,
        blocking: true,
        message: "Password must be at least 8 characters long",
        suggestion: "Use at least 8 characters",
        check: |p| p.chars().count() >= MIN_LENGTH,
    },
    Requirement {
        weight: 10,
        blocking: true,
        message: "Password must contain at least one uppercase letter",
        suggestion: "Add an uppercase letter",
        check: |p| p.chars().any(|c| c.is_uppercase()),
    },
    Requirement {
        weight: 10,
        blocking: true,
        message: "Password must contain at least one lowercase letter",
        suggestion: "Add a lowercase letter",
        check: |p| p.chars().any(|c| c.is_lowercase()),
    },
    Requirement {
        weight: 10,
        blocking: true,
        message: "Password must contain at least one number",
        suggestion: "Add a number",
        check: |p| p.chars().any(|c| c.is_ascii_digit()),
    },
    Requirement {
        weight: 10,
        blocking: true,
        message: "Password must contain at least one special character",
        suggestion: "Add a special character such as ! # % or &",
        check: |p| p.chars().any(is_special),
    },
    Requirement {
        weight: 20,
        blocking: true,
        message: "Password is too common",
        suggestion: "Avoid common passwords and simple variations of them",
        check: |p| !is_common_password(p),
    },
    Requirement {
        weight: 10,
        blocking: false,
        message: "Password contains sequential characters (e.g. 123, abc)",
        suggestion: "Avoid sequences like 123 or abc",
        check: |p| !has_sequential_run(p),
    },
    Requirement {
        weight: 5,
        blocking: false,
        message: "Password repeats the same character several times in a row",
        suggestion: "Avoid repeating the same character",
        check: |p| !has_repeated_run(p),
    },
];

pub fn validate_password_security(password: &str, user_info: Option<UserInfo<'_>>) -> PasswordEvaluation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut suggestions = Vec::new();

    let total_weight: u32 = REQUIREMENTS.iter().map(|r| r.weight).sum();
    let mut earned = 0u32;

    for req in REQUIREMENTS {
        if (req.check)(password) {
            earned += req.weight;
        } else {
            if req.blocking {
                errors.push(req.message.to_string());
            } else {
                warnings.push(req.message.to_string());
            }
            suggestions.push(req.suggestion.to_string());
        }
    }

    let mut score = (earned as f64 / total_weight as f64 * 100.0).round() as i32;

    let lower = password.to_lowercase();
    if KEYBOARD_WALKS.iter().any(|walk| lower.contains(walk)) {
        score -= 10;
        warnings.push("Password contains a keyboard pattern".to_string());
        suggestions.push("Avoid keyboard patterns like qwerty or asdf".to_string());
    }
    if contains_date_pattern(password) {
        score -= 10;
        warnings.push("Password contains a date or year".to_string());
        suggestions.push("Avoid dates, birthdays and years".to_string());
    }

    let length = password.chars().count();
    if length >= 12 {
        score += 5;
    } else {
        suggestions.push("Use 12 or more characters for a stronger password".to_string());
    }
    if length >= 16 {
        score += 5;
    }
    if estimate_entropy(password) > ENTROPY_BONUS_THRESHOLD {
        score += 10;
    }

    if let Some(info) = user_info {
        for message in similarity_errors(password, &info) {
            errors.push(message);
        }
    }

    suggestions.dedup();

    PasswordEvaluation {
        is_valid: errors.is_empty(),
        score: score.clamp(0, 100) as u8,
        errors,
        warnings,
        suggestions,
    }
}

fn is_special(c: char) -> bool {
    !c.is_alphanumeric() && !c.is_whitespace()
}

fn is_common_password(password: &str) -> bool {
    let lower = password.to_lowercase();
    let trimmed = lower.trim_end_matches(|c: char| !c.is_alphanumeric());
    COMMON_PASSWORDS
        .iter()
        .any(|common| *common == lower || *common == trimmed)
}

/// Three consecutive letters or digits that step by exactly one, in either direction.
fn has_sequential_run(password: &str) -> bool {
    let chars: Vec<char> = password.to_lowercase().chars().collect();
    chars.windows(3).any(|w| {
        let same_class = w.iter().all(|c| c.is_ascii_digit()) || w.iter().all(|c| c.is_ascii_lowercase());
        if !same_class {
            return false;
        }
        let (a, b, c) = (w[0] as i32, w[1] as i32, w[2] as i32);
        (b - a == 1 && c - b == 1) || (a - b == 1 && b - c == 1)
    })
}

fn has_repeated_run(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();
    chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

/// Years 1900–2099 or day/month shapes like `12/05`, `3-11`, `01.02`.
fn contains_date_pattern(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();

    let has_year = chars.windows(4).any(|w| {
        w.iter().all(|c| c.is_ascii_digit())
            && matches!((w[0], w[1]), ('1', '9') | ('2', '0'))
    });
    if has_year {
        return true;
    }

    for (i, c) in chars.iter().enumerate() {
        if !matches!(c, '/' | '-' | '.') {
            continue;
        }
        let before = chars[..i]
            .iter()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .count();
        let after = chars[i + 1..]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if (1..=2).contains(&before) && (1..=2).contains(&after) {
            return true;
        }
    }
    false
}

/// `length × log2(alphabet)` where the alphabet is built from the character
/// classes that actually appear.
pub fn estimate_entropy(password: &str) -> f64 {
    let mut alphabet = 0u32;
    if password.chars().any(|c| c.is_ascii_lowercase()) {
        alphabet += 26;
    }
    if password.chars().any(|c| c.is_ascii_uppercase()) {
        alphabet += 26;
    }
    if password.chars().any(|c| c.is_ascii_digit()) {
        alphabet += 10;
    }
    if password.chars().any(|c| !c.is_ascii_alphanumeric()) {
        alphabet += 32;
    }
    if alphabet == 0 {
        return 0.0;
    }
    password.chars().count() as f64 * (alphabet as f64).log2()
}

fn alnum_lower(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(alnum_lower)
        .filter(|t| t.chars().count() >= MIN_SIMILARITY_FRAGMENT)
        .collect()
}

/// True when any run of `MIN_SIMILARITY_FRAGMENT` consecutive characters of a
/// fragment appears in the password.
fn shares_fragment(haystack: &str, fragments: &[String]) -> bool {
    fragments.iter().any(|fragment| {
        let chars: Vec<char> = fragment.chars().collect();
        chars
            .windows(MIN_SIMILARITY_FRAGMENT)
            .any(|w| haystack.contains(w.iter().collect::<String>().as_str()))
    })
}

fn similarity_errors(password: &str, info: &UserInfo<'_>) -> Vec<String> {
    let haystack = alnum_lower(password);
    let mut errors = Vec::new();

    if let Some(email) = info.email {
        let (local, domain) = email.split_once('@').unwrap_or((email, ""));
        if shares_fragment(&haystack, &tokens(local)) {
            errors.push("Password must not contain your email address".to_string());
        }

        let domain_label = domain.split('.').next().unwrap_or_default();
        if shares_fragment(&haystack, &tokens(domain_label)) {
            errors.push("Password must not contain your email domain".to_string());
        }
    }

    if let Some(name) = info.name {
        if shares_fragment(&haystack, &tokens(name)) {
            errors.push("Password must not contain your name".to_string());
        }
    }

    if let Some(company) = info.company_name {
        if shares_fragment(&haystack, &tokens(company)) {
            errors.push("Password must not contain your company name".to_string());
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRONG: &str = "Vk7#pLq9!mZr2&Xw";

    #[test]
    fn test_strong_password_is_valid() {
        let r = validate_password_security(STRONG, None);
        assert!(r.is_valid, "errors: {:?}", r.errors);
        assert!(r.errors.is_empty());
        assert!(r.score >= 90, "score was {}", r.score);
    }

    #[test]
    fn test_common_password_rejected() {
        let r = validate_password_security("password123", None);
        assert!(!r.is_valid);
        assert!(r.errors.iter().any(|e| e.contains("too common")));
    }

    #[test]
    fn test_common_password_with_suffix_symbols_rejected() {
        let r = validate_password_security("Password123!", None);
        assert!(r.errors.iter().any(|e| e.contains("too common")));
    }

    #[test]
    fn test_short_password_rejected() {
        let r = validate_password_security("Ab1!", None);
        assert!(!r.is_valid);
        assert!(r.errors.iter().any(|e| e.contains("at least 8 characters")));
    }

    #[test]
    fn test_missing_classes_each_reported() {
        let r = validate_password_security("alllowercaseletters", None);
        assert!(r.errors.iter().any(|e| e.contains("uppercase")));
        assert!(r.errors.iter().any(|e| e.contains("number")));
        assert!(r.errors.iter().any(|e| e.contains("special")));
        assert!(!r.errors.iter().any(|e| e.contains("lowercase")));
    }

    #[test]
    fn test_sequence_is_warning_not_error() {
        let r = validate_password_security("Zp#4abcQ!wm", None);
        assert!(r.is_valid, "errors: {:?}", r.errors);
        assert!(r.warnings.iter().any(|w| w.contains("sequential")));
    }

    #[test]
    fn test_repetition_is_warning() {
        let r = validate_password_security("Zp#4aaaQ!wm", None);
        assert!(r.warnings.iter().any(|w| w.contains("repeats")));
    }

    #[test]
    fn test_keyboard_walk_lowers_score() {
        let plain = validate_password_security("Tr#8mVp!Lk", None);
        let walk = validate_password_security("Tr#8qwertL", None);
        assert!(walk.warnings.iter().any(|w| w.contains("keyboard")));
        assert!(walk.score < plain.score);
    }

    #[test]
    fn test_embedded_year_is_flagged() {
        let r = validate_password_security("Gm!x1987Kp", None);
        assert!(r.warnings.iter().any(|w| w.contains("date")));
    }

    #[test]
    fn test_day_month_shape_is_flagged() {
        assert!(contains_date_pattern("Kp!12/05xx"));
        assert!(contains_date_pattern("a3-11b"));
        assert!(!contains_date_pattern("Kp!123/456"));
        assert!(!contains_date_pattern("Vk7#pLq9"));
    }

    #[test]
    fn test_email_local_part_similarity() {
        let info = UserInfo {
            email: Some("jane.doe@x.com"),
            ..Default::default()
        };
        let r = validate_password_security("JaneDoe2024!", Some(info));
        assert!(!r.is_valid);
        assert!(r.errors.iter().any(|e| e.contains("email address")));
    }

    #[test]
    fn test_partial_email_local_part_rejected() {
        let info = UserInfo {
            email: Some("johnsmith@x.com"),
            ..Default::default()
        };
        let r = validate_password_security("Smith!Xy9zQ#", Some(info));
        assert!(!r.is_valid);
        assert!(r.errors.iter().any(|e| e.contains("email address")));

        let r = validate_password_security("Smi7h!Xy9zQ#", Some(info));
        assert!(r.is_valid, "errors: {:?}", r.errors);
    }

    #[test]
    fn test_short_identity_fragments_ignored() {
        let info = UserInfo {
            email: Some("al@x.io"),
            name: Some("Al Li"),
            company_name: None,
        };
        let r = validate_password_security("Alpha#Beta7z", Some(info));
        assert!(r.is_valid, "errors: {:?}", r.errors);
    }

    #[test]
    fn test_company_and_name_similarity() {
        let info = UserInfo {
            email: Some("hr@globex.com"),
            name: Some("Hank Scorpio"),
            company_name: Some("Globex Corporation"),
        };
        let r = validate_password_security("Scorpio!Globex9", Some(info));
        assert!(r.errors.iter().any(|e| e.contains("your name")));
        assert!(r.errors.iter().any(|e| e.contains("company name")));
        assert!(r.errors.iter().any(|e| e.contains("email domain")));
    }

    #[test]
    fn test_entropy_uses_present_classes() {
        let digits_only = estimate_entropy("12345678");
        assert!((digits_only - 8.0 * 10f64.log2()).abs() < 1e-9);
        assert!(estimate_entropy(STRONG) > ENTROPY_BONUS_THRESHOLD);
        assert_eq!(estimate_entropy(""), 0.0);
    }

    #[test]
    fn test_score_bounded() {
        for pw in ["", "a", "password", STRONG, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"] {
            assert!(validate_password_security(pw, None).score <= 100);
        }
    }

    #[test]
    fn test_long_password_gets_length_bonus() {
        let short = validate_password_security("Tr#8mVp!Lk", None);
        let long = validate_password_security("Tr#8mVp!LkTr#8mVp!Lk", None);
        assert!(long.score >= short.score);
        assert!(!long.suggestions.iter().any(|s| s.contains("12 or more")));
    }
}
