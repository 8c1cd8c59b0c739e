use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::evaluation::error::NormalizationError;
use crate::schema::{NumberFormat, RawValue};

const DATE_FORMATS: [&str; 5] = ["%d.%m.%Y", "%Y-%m-%d", "%Y.%m.%d", "%d/%m/%Y", "%Y/%m/%d"];
const CURRENCY_SYMBOLS: [char; 4] = ['€', '$', '£', '%'];

pub fn normalize_date(raw: &RawValue) -> Result<NaiveDate, NormalizationError> {
    let text = raw.as_text();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError::Empty);
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| NormalizationError::UnparseableDate(trimmed.to_string()))
}

/// Canonicalizes a monetary amount or percentage to two decimals.
///
/// The rightmost separator followed by exactly two digits is the decimal
/// separator. With both `,` and `.` present the rightmost one is decimal.
/// A lone separator followed by a three digit group cannot be resolved
/// without `format`.
pub fn normalize_amount(
    raw: &RawValue,
    format: Option<NumberFormat>,
) -> Result<f64, NormalizationError> {
    match raw {
        RawValue::Number(number) if number.is_finite() => Ok(round_cents(*number)),
        RawValue::Number(number) => Err(NormalizationError::UnparseableAmount(number.to_string())),
        RawValue::Text(text) => parse_amount_text(text, format),
    }
}

fn parse_amount_text(text: &str, format: Option<NumberFormat>) -> Result<f64, NormalizationError> {
    let unparseable = || NormalizationError::UnparseableAmount(text.trim().to_string());

    let decorated = text.trim_matches(|character: char| {
        character.is_whitespace()
            || character.is_alphabetic()
            || CURRENCY_SYMBOLS.contains(&character)
    });
    let compact = decorated
        .chars()
        .filter(|character| !character.is_whitespace() && *character != '\'')
        .collect::<String>();
    if compact.is_empty() {
        return Err(NormalizationError::Empty);
    }

    let (negative, body) = match compact.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, compact.strip_prefix('+').unwrap_or(&compact)),
    };
    if !body
        .chars()
        .all(|character| character.is_ascii_digit() || character == '.' || character == ',')
        || !body.chars().any(|character| character.is_ascii_digit())
    {
        return Err(unparseable());
    }

    let decimal_index = resolve_decimal_separator(body, format)?;
    let mut digits = String::with_capacity(body.len());
    for (index, character) in body.char_indices() {
        match character {
            '.' | ',' if Some(index) == decimal_index => digits.push('.'),
            '.' | ',' => {}
            other => digits.push(other),
        }
    }

    let value = digits.parse::<f64>().map_err(|_| unparseable())?;
    Ok(round_cents(if negative { -value } else { value }))
}

/// Byte index of the decimal separator in `body`, or `None` when every
/// separator is a grouping mark.
fn resolve_decimal_separator(
    body: &str,
    format: Option<NumberFormat>,
) -> Result<Option<usize>, NormalizationError> {
    let Some(last_index) = body.rfind(|character: char| character == '.' || character == ',') else {
        return Ok(None);
    };
    let last = body[last_index..].chars().next().unwrap_or('.');
    let digits_after = body.len() - last_index - 1;
    let occurrences = body.matches(last).count();
    let mixed = body.contains('.') && body.contains(',');

    if mixed {
        if occurrences > 1 {
            return Err(NormalizationError::UnparseableAmount(body.to_string()));
        }
        return Ok(Some(last_index));
    }

    if digits_after == 2 {
        return Ok(Some(last_index));
    }

    if occurrences > 1 {
        let well_grouped = body
            .split(last)
            .skip(1)
            .all(|group| group.len() == 3);
        return if well_grouped {
            Ok(None)
        } else {
            Err(NormalizationError::UnparseableAmount(body.to_string()))
        };
    }

    if digits_after == 3 {
        return match format {
            Some(format) if format.decimal_separator() == last => Ok(Some(last_index)),
            Some(_) => Ok(None),
            None => Err(NormalizationError::AmbiguousSeparator(body.to_string())),
        };
    }

    Ok(Some(last_index))
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Per-field canonicalization for exact codes.
#[derive(Debug, Clone)]
pub struct CodeRule {
    pattern: Option<Regex>,
    strip_chars: HashSet<char>,
    aliases: HashMap<String, String>,
}

impl CodeRule {
    pub fn new(
        pattern: Option<&str>,
        strip_chars: &str,
        aliases: &BTreeMap<String, String>,
    ) -> Result<Self, regex::Error> {
        let pattern = pattern.map(Regex::new).transpose()?;
        let strip_chars = strip_chars.chars().collect::<HashSet<_>>();
        let aliases = aliases
            .iter()
            .map(|(alias, code)| {
                (
                    canonicalize_code(alias, &strip_chars),
                    canonicalize_code(code, &strip_chars),
                )
            })
            .collect();

        Ok(Self {
            pattern,
            strip_chars,
            aliases,
        })
    }
}

fn canonicalize_code(raw: &str, strip_chars: &HashSet<char>) -> String {
    raw.chars()
        .filter(|character| !character.is_whitespace() && !strip_chars.contains(character))
        .flat_map(char::to_uppercase)
        .collect()
}

/// Uppercases and strips whitespace, then validates against the rule's
/// pattern. Anything that fails validation is treated as not provided.
pub fn normalize_code(raw: &RawValue, rule: &CodeRule) -> Option<String> {
    let canonical = canonicalize_code(&raw.as_text(), &rule.strip_chars);
    let canonical = rule.aliases.get(&canonical).cloned().unwrap_or(canonical);
    if canonical.is_empty() {
        return None;
    }

    match &rule.pattern {
        Some(pattern) if !pattern.is_match(&canonical) => None,
        _ => Some(canonical),
    }
}

/// Lowercases, strips diacritics after compatibility decomposition, turns
/// punctuation into spaces and collapses whitespace. `&` and `und` both
/// become `and`.
pub fn normalize_text(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    let characters = raw
        .nfkd()
        .flat_map(char::to_lowercase)
        .filter(|character| !is_combining_mark(*character));
    for character in characters {
        match fold_letter(character) {
            Some(replacement) => folded.push_str(replacement),
            None if character == '&' => folded.push_str(" and "),
            None if character.is_alphanumeric() => folded.push(character),
            None => folded.push(' '),
        }
    }

    folded
        .split_whitespace()
        .map(|token| if token == "und" { "and" } else { token })
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Letters without a canonical decomposition into base letter and mark.
fn fold_letter(character: char) -> Option<&'static str> {
    let folded = match character {
        'ß' => "ss",
        'æ' => "ae",
        'œ' => "oe",
        'ø' => "o",
        'ł' => "l",
        'đ' => "d",
        'ı' => "i",
        _ => return None,
    };
    Some(folded)
}

/// Similarity in `[0, 1]` of two already normalized strings: the better of
/// normalized edit distance and token-set overlap.
pub fn text_similarity(left: &str, right: &str) -> f64 {
    if left == right {
        return 1.0;
    }

    let edit = strsim::normalized_levenshtein(left, right);

    let left_tokens = left.split_whitespace().collect::<HashSet<&str>>();
    let right_tokens = right.split_whitespace().collect::<HashSet<&str>>();
    let union = left_tokens.union(&right_tokens).count();
    let overlap = if union == 0 {
        0.0
    } else {
        left_tokens.intersection(&right_tokens).count() as f64 / union as f64
    };

    edit.max(overlap)
}
