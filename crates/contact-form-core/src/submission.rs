use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 100;
pub const MESSAGE_MIN_CHARS: usize = 10;
pub const MESSAGE_MAX_CHARS: usize = 2000;

/// Cheap `local@domain.tld` shape check, not full address validation.
const EMAIL_SHAPE: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

// A constant pattern; `None` only if the literal above is broken, in which
// case every address is rejected.
static EMAIL_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(EMAIL_SHAPE).ok());

/// Submission fields in the order errors are reported.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Field {
    Name,
    Email,
    Message,
    Honeypot,
}

impl Field {
    pub const ALL: [Self; 4] = [Self::Name, Self::Email, Self::Message, Self::Honeypot];

    /// Wire name of the field in the JSON payload.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Email => "email",
            Self::Message => "message",
            Self::Honeypot => "hp",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "name" => Some(Self::Name),
            "email" => Some(Self::Email),
            "message" => Some(Self::Message),
            "hp" => Some(Self::Honeypot),
            _ => None,
        }
    }
}

/// Field-level errors keyed in [`Field`] declaration order.
pub type FieldErrors = BTreeMap<Field, &'static str>;

/// Raw payload of `POST /api/contact`. Missing and `null` fields read as empty.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Submission {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub hp: Option<String>,
}

/// Trimmed values that get persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSubmission {
    pub name: String,
    pub email: String,
    pub message: String,
}

impl Submission {
    #[must_use]
    pub fn field(&self, field: Field) -> &str {
        let raw = match field {
            Field::Name => &self.name,
            Field::Email => &self.email,
            Field::Message => &self.message,
            Field::Honeypot => &self.hp,
        };
        raw.as_deref().map_or("", str::trim)
    }

    #[must_use]
    pub fn normalized(&self) -> NormalizedSubmission {
        NormalizedSubmission {
            name: self.field(Field::Name).to_string(),
            email: self.field(Field::Email).to_string(),
            message: self.field(Field::Message).to_string(),
        }
    }
}

/// Runs every field rule and collects all violations. An empty map means the
/// submission is acceptable.
#[must_use]
pub fn validate_submission(submission: &Submission) -> FieldErrors {
    let mut errors = FieldErrors::new();

    if !within(submission.field(Field::Name), NAME_MIN_CHARS, NAME_MAX_CHARS) {
        errors.insert(Field::Name, "Name must be between 2 and 100 characters.");
    }

    if !email_has_valid_shape(submission.field(Field::Email)) {
        errors.insert(Field::Email, "Email address is not in a valid format.");
    }

    if !within(submission.field(Field::Message), MESSAGE_MIN_CHARS, MESSAGE_MAX_CHARS) {
        errors.insert(Field::Message, "Message must be between 10 and 2000 characters.");
    }

    if !submission.field(Field::Honeypot).is_empty() {
        errors.insert(Field::Honeypot, "Honeypot field was filled in (suspected bot).");
    }

    errors
}

/// Renders errors as `field: message` pairs joined by `"; "`.
#[must_use]
pub fn join_field_errors(errors: &FieldErrors) -> String {
    errors
        .iter()
        .map(|(field, message)| format!("{}: {message}", field.as_str()))
        .collect::<Vec<_>>()
        .join("; ")
}

fn within(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.chars().count())
}

fn email_has_valid_shape(value: &str) -> bool {
    EMAIL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn valid_submission() -> Submission {
        Submission {
            name: Some("Ali".to_string()),
            email: Some("ali@example.com".to_string()),
            message: Some("Salam, necesiniz?".to_string()),
            hp: Some(String::new()),
        }
    }

    fn with_name(name: String) -> Submission {
        Submission { name: Some(name), ..valid_submission() }
    }

    fn with_message(message: String) -> Submission {
        Submission { message: Some(message), ..valid_submission() }
    }

    #[test]
    fn email_pattern_compiles() {
        assert!(EMAIL_PATTERN.is_some());
    }

    #[test]
    fn valid_submission_has_no_errors() {
        assert!(validate_submission(&valid_submission()).is_empty());
    }

    #[test]
    fn missing_fields_are_treated_as_empty() {
        let errors = validate_submission(&Submission::default());
        let fields: Vec<Field> = errors.keys().copied().collect();
        assert_eq!(fields, vec![Field::Name, Field::Email, Field::Message]);
    }

    #[test]
    fn all_violations_are_reported_together_in_field_order() {
        let submission = Submission {
            name: Some("A".to_string()),
            email: Some("not-an-email".to_string()),
            message: Some("short".to_string()),
            hp: Some("spam".to_string()),
        };
        let errors = validate_submission(&submission);
        let fields: Vec<Field> = errors.keys().copied().collect();
        assert_eq!(fields, Field::ALL.to_vec());

        let joined = join_field_errors(&errors);
        assert!(joined.starts_with("name: "));
        assert!(joined.contains("; email: "));
        assert!(joined.contains("; message: "));
        assert!(joined.ends_with("hp: Honeypot field was filled in (suspected bot)."));
    }

    #[test]
    fn honeypot_rejects_otherwise_valid_submission() {
        let submission = Submission { hp: Some("spam".to_string()), ..valid_submission() };
        let errors = validate_submission(&submission);
        assert_eq!(errors.len(), 1);
        assert!(errors.contains_key(&Field::Honeypot));
    }

    #[test]
    fn whitespace_only_honeypot_is_ignored() {
        let submission = Submission { hp: Some("  \t".to_string()), ..valid_submission() };
        assert!(validate_submission(&submission).is_empty());
    }

    #[test]
    fn email_shape_examples() {
        for accepted in ["a@b.c", "ali@example.com", "first.last@sub.example.org"] {
            assert!(email_has_valid_shape(accepted), "expected {accepted} to pass");
        }
        for rejected in [
            "",
            "not-an-email",
            "missing-at.example.com",
            "ali@example",
            "ali @example.com",
            "ali@exa mple.com",
            "ali@@example.com",
            "@example.com",
            "ali@.",
        ] {
            assert!(!email_has_valid_shape(rejected), "expected {rejected:?} to fail");
        }
    }

    #[test]
    fn email_is_trimmed_before_shape_check() {
        let submission =
            Submission { email: Some("  ali@example.com \n".to_string()), ..valid_submission() };
        assert!(validate_submission(&submission).is_empty());
    }

    #[test]
    fn length_is_counted_in_characters_not_bytes() {
        // 2 characters, 3 bytes.
        assert!(validate_submission(&with_name("Əli".chars().take(2).collect())).is_empty());
        assert!(validate_submission(&with_message("ə".repeat(MESSAGE_MAX_CHARS))).is_empty());
    }

    #[test]
    fn message_boundaries_pass() {
        assert!(validate_submission(&with_message("x".repeat(MESSAGE_MIN_CHARS))).is_empty());
        assert!(validate_submission(&with_message("x".repeat(MESSAGE_MAX_CHARS))).is_empty());
        assert!(validate_submission(&with_message("x".repeat(MESSAGE_MIN_CHARS - 1)))
            .contains_key(&Field::Message));
        assert!(validate_submission(&with_message("x".repeat(MESSAGE_MAX_CHARS + 1)))
            .contains_key(&Field::Message));
    }

    #[test]
    fn field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::parse(field.as_str()), Some(field));
        }
        assert_eq!(Field::parse("website"), None);
    }

    #[test]
    fn null_fields_deserialize_as_missing() {
        let submission: Submission = match serde_json::from_str(
            r#"{"name": null, "email": "ali@example.com", "message": "Salam, necesiniz?"}"#,
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to decode submission: {err}"),
        };
        assert_eq!(submission.field(Field::Name), "");
        assert_eq!(submission.field(Field::Honeypot), "");
    }

    proptest! {
        #[test]
        fn prop_name_length_bounds(len in 0usize..140, pad in 0usize..4) {
            let padding = " ".repeat(pad);
            let name = format!("{padding}{}{padding}", "n".repeat(len));
            let has_error = validate_submission(&with_name(name)).contains_key(&Field::Name);
            prop_assert_eq!(has_error, !(NAME_MIN_CHARS..=NAME_MAX_CHARS).contains(&len));
        }

        #[test]
        fn prop_message_length_bounds(len in 0usize..2100) {
            let has_error =
                validate_submission(&with_message("m".repeat(len))).contains_key(&Field::Message);
            prop_assert_eq!(has_error, !(MESSAGE_MIN_CHARS..=MESSAGE_MAX_CHARS).contains(&len));
        }

        #[test]
        fn prop_non_empty_honeypot_always_rejected(hp in "[a-z0-9]{1,16}") {
            let submission = Submission { hp: Some(hp), ..valid_submission() };
            prop_assert!(validate_submission(&submission).contains_key(&Field::Honeypot));
        }

        #[test]
        fn prop_email_with_whitespace_is_rejected(local in "[a-z]{1,8}", ws in "[ \t]") {
            let email = format!("{local}{ws}x@example.com");
            prop_assert!(!email_has_valid_shape(&email));
        }
    }
}
