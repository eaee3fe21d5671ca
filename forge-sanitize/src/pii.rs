//! PII redaction sanitizer

use crate::{SanitizeOutcome, Sanitizer};
use once_cell::sync::Lazy;
use regex::Regex;

/// Kinds of personally identifiable information the redactor recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    Phone,
    Email,
    NationalId,
    BankCard,
    IpAddress,
    Url,
}

impl PiiKind {
    pub const ALL: [PiiKind; 6] = [
        PiiKind::NationalId,
        PiiKind::BankCard,
        PiiKind::Phone,
        PiiKind::Email,
        PiiKind::IpAddress,
        PiiKind::Url,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PiiKind::Phone => "phone",
            PiiKind::Email => "email",
            PiiKind::NationalId => "id_card",
            PiiKind::BankCard => "bank_card",
            PiiKind::IpAddress => "ip_address",
            PiiKind::Url => "url",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "phone" => Some(PiiKind::Phone),
            "email" => Some(PiiKind::Email),
            "id_card" => Some(PiiKind::NationalId),
            "bank_card" => Some(PiiKind::BankCard),
            "ip_address" => Some(PiiKind::IpAddress),
            "url" => Some(PiiKind::Url),
            _ => None,
        }
    }
}

// The `regex` crate has no lookaround; digit patterns get their anti-merge
// guard from an explicit neighbour check on the match boundaries instead.
static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"1[3-9][0-9]{9}").expect("phone pattern"));
static EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern")
});
// 18-digit national id: region code (never 0-led), birth date, sequence,
// checksum digit or X. The date structure is what separates a real id from
// an arbitrary 18-digit number, so a long card or order number cannot be
// claimed by this pattern.
static NATIONAL_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"[1-9][0-9]{5}(?:19|20)[0-9]{2}(?:0[1-9]|1[0-2])(?:0[1-9]|[12][0-9]|3[01])[0-9]{3}[0-9Xx]",
    )
    .expect("national id pattern")
});
static BANK_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{16,19}").expect("bank card pattern"));
static IP_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}").expect("ip pattern")
});
static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).expect("url pattern"));

#[derive(Debug)]
struct PiiMatch {
    kind: PiiKind,
    start: usize,
    end: usize,
}

/// Detects and masks PII with a partial-reveal form (first digits kept, tail
/// kept, middle masked). Redaction is transformative; the outcome always
/// passes.
pub struct PiiRedactor {
    kinds: Vec<PiiKind>,
}

impl PiiRedactor {
    pub fn new(kinds: Vec<PiiKind>) -> Self {
        Self { kinds }
    }

    pub fn all() -> Self {
        Self::new(PiiKind::ALL.to_vec())
    }

    /// Subset by policy names; unknown names are ignored, empty means all.
    pub fn from_names(names: &[String]) -> Self {
        if names.is_empty() {
            return Self::all();
        }
        let kinds: Vec<PiiKind> = PiiKind::ALL
            .into_iter()
            .filter(|kind| names.iter().any(|n| n == kind.name()))
            .collect();
        Self::new(kinds)
    }

    fn pattern(kind: PiiKind) -> &'static Regex {
        match kind {
            PiiKind::Phone => &PHONE,
            PiiKind::Email => &EMAIL,
            PiiKind::NationalId => &NATIONAL_ID,
            PiiKind::BankCard => &BANK_CARD,
            PiiKind::IpAddress => &IP_ADDRESS,
            PiiKind::Url => &URL,
        }
    }

    /// Digit-shaped matches must not sit inside a longer digit run.
    fn digit_bounded(kind: PiiKind) -> bool {
        matches!(
            kind,
            PiiKind::Phone | PiiKind::NationalId | PiiKind::BankCard
        )
    }

    fn boundary_ok(content: &str, start: usize, end: usize) -> bool {
        let before = content[..start].chars().next_back();
        let after = content[end..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    }

    fn collect_matches(&self, content: &str) -> Vec<PiiMatch> {
        let mut matches = Vec::new();
        // PiiKind::ALL is ordered longest-pattern-first so an 18-digit id is
        // claimed before the bank-card pattern can take its prefix.
        for kind in PiiKind::ALL {
            if !self.kinds.contains(&kind) {
                continue;
            }
            for found in Self::pattern(kind).find_iter(content) {
                if Self::digit_bounded(kind)
                    && !Self::boundary_ok(content, found.start(), found.end())
                {
                    continue;
                }
                let overlaps = matches
                    .iter()
                    .any(|m: &PiiMatch| found.start() < m.end && m.start < found.end());
                if !overlaps {
                    matches.push(PiiMatch {
                        kind,
                        start: found.start(),
                        end: found.end(),
                    });
                }
            }
        }
        matches.sort_by_key(|m| m.start);
        matches
    }

    fn mask(kind: PiiKind, original: &str) -> String {
        match kind {
            PiiKind::Phone => Self::partial(original, 3, 4),
            PiiKind::NationalId => Self::partial(original, 6, 4),
            PiiKind::BankCard => Self::partial(original, 4, 4),
            PiiKind::Email => {
                match original.split_once('@') {
                    Some((local, domain)) => {
                        let first = local.chars().next().map(String::from).unwrap_or_default();
                        format!("{first}***@{domain}")
                    }
                    None => "***".to_string(),
                }
            }
            PiiKind::IpAddress => {
                let octets: Vec<&str> = original.split('.').collect();
                match octets.as_slice() {
                    [first, _, _, last] => format!("{first}.***.***.{last}"),
                    _ => "***".to_string(),
                }
            }
            PiiKind::Url => {
                // Keep scheme and host, mask the path and query.
                match original.find("://") {
                    Some(scheme_end) => {
                        let rest = &original[scheme_end + 3..];
                        match rest.find('/') {
                            Some(path_start) => format!(
                                "{}***",
                                &original[..scheme_end + 3 + path_start + 1]
                            ),
                            None => original.to_string(),
                        }
                    }
                    None => "***".to_string(),
                }
            }
        }
    }

    /// Keep `prefix` and `suffix` chars, mask the middle with one '*' per
    /// hidden character.
    fn partial(original: &str, prefix: usize, suffix: usize) -> String {
        let chars: Vec<char> = original.chars().collect();
        if chars.len() <= prefix + suffix {
            return "*".repeat(chars.len());
        }
        let hidden = chars.len() - prefix - suffix;
        format!(
            "{}{}{}",
            chars[..prefix].iter().collect::<String>(),
            "*".repeat(hidden),
            chars[chars.len() - suffix..].iter().collect::<String>()
        )
    }
}

impl Sanitizer for PiiRedactor {
    fn name(&self) -> &str {
        "pii_redactor"
    }

    fn sanitize(&self, content: &str) -> Result<SanitizeOutcome, String> {
        if content.is_empty() || self.kinds.is_empty() {
            return Ok(SanitizeOutcome::pass(content));
        }

        let matches = self.collect_matches(content);
        if matches.is_empty() {
            return Ok(SanitizeOutcome::pass(content));
        }

        let mut redacted = String::with_capacity(content.len());
        let mut cursor = 0;
        let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
        for m in &matches {
            redacted.push_str(&content[cursor..m.start]);
            redacted.push_str(&Self::mask(m.kind, &content[m.start..m.end]));
            *counts.entry(m.kind.name()).or_insert(0) += 1;
            cursor = m.end;
        }
        redacted.push_str(&content[cursor..]);

        let summary: Vec<String> = counts
            .iter()
            .map(|(name, count)| format!("{name} x{count}"))
            .collect();
        Ok(SanitizeOutcome::pass(redacted)
            .with_warning(format!("redacted PII: {}", summary.join(", ")))
            .with_metadata("redactions", serde_json::json!(counts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redact(text: &str) -> String {
        PiiRedactor::all().sanitize(text).unwrap().content
    }

    #[test]
    fn test_phone_partial_reveal() {
        assert_eq!(redact("call 13800138000 now"), "call 138****8000 now");
    }

    #[test]
    fn test_phone_inside_digit_run_untouched() {
        // Anti-merge: part of a longer number is not a phone.
        let text = "order 913800138000123";
        assert_eq!(redact(text), text);
    }

    #[test]
    fn test_national_id_masked() {
        assert_eq!(
            redact("id: 110101199001011234"),
            "id: 110101********1234"
        );
    }

    #[test]
    fn test_bank_card_masked() {
        assert_eq!(redact("card 6222021234567890"), "card 6222********7890");
    }

    #[test]
    fn test_eighteen_digit_card_is_not_an_id() {
        // Same length as a national id, but no valid birth-date structure:
        // the bank-card mask (4+4 reveal) applies, not the id mask (6+4).
        assert_eq!(
            redact("card 622202123456789012"),
            "card 6222**********9012"
        );
    }

    #[test]
    fn test_id_with_invalid_month_untouched_by_id_pattern() {
        // Month 13 is impossible; the digits fall through to bank card.
        assert_eq!(
            redact("n 110101199013011234"),
            "n 1101**********1234"
        );
    }

    #[test]
    fn test_email_keeps_domain() {
        assert_eq!(redact("mail zoe@example.com"), "mail z***@example.com");
    }

    #[test]
    fn test_ip_masks_middle_octets() {
        assert_eq!(redact("from 192.168.10.44"), "from 192.***.***.44");
    }

    #[test]
    fn test_url_masks_path() {
        assert_eq!(
            redact("see https://example.com/users/42?token=abc"),
            "see https://example.com/***"
        );
        // A bare host has nothing sensitive to hide.
        assert_eq!(redact("see https://example.com"), "see https://example.com");
    }

    #[test]
    fn test_redaction_passes() {
        let outcome = PiiRedactor::all().sanitize("13800138000").unwrap();
        assert!(outcome.passed);
        assert!(outcome.warning.unwrap().contains("phone"));
    }

    #[test]
    fn test_subset_by_name() {
        let redactor = PiiRedactor::from_names(&["email".to_string()]);
        let outcome = redactor.sanitize("13800138000 and a@b.co").unwrap();
        // Phone left alone, email masked.
        assert!(outcome.content.contains("13800138000"));
        assert!(outcome.content.contains("a***@b.co"));
    }

    #[test]
    fn test_no_pii_no_change() {
        let outcome = PiiRedactor::all().sanitize("nothing sensitive").unwrap();
        assert_eq!(outcome.content, "nothing sensitive");
        assert!(outcome.warning.is_none());
    }
}
