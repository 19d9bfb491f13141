//! Inline parameter overrides embedded in prompt text, e.g. `cat seed=42 steps:30 scale=8.5`.
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct Overrides {
    pub(crate) seed: Option<u32>,
    pub(crate) steps: Option<u32>,
    pub(crate) scale: Option<f64>,
    pub(crate) count: Option<u32>,
}

static INTEGER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(seed|steps|count)[:=]\s?(\d+)").unwrap());
static SCALE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bscale[:=]\s?(\d+(?:\.\d+)?)").unwrap());
static EMPTY_GROUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[(|]\s*[)|]").unwrap());

/// Removes every recognised `key[:=]value` token from `text` and returns the remaining text,
/// normalised, together with the captured values.
///
/// Later tokens win over earlier ones. Tokens whose value does not parse are left in place.
pub(crate) fn extract(text: &str) -> (String, Overrides) {
    let mut overrides = Overrides::default();

    let text = SCALE_TOKEN.replace_all(text, |captures: &Captures| {
        match captures[1].parse() {
            Ok(scale) => {
                overrides.scale = Some(scale);
                String::new()
            }
            Err(_) => captures[0].to_owned(),
        }
    });
    let text = INTEGER_TOKEN.replace_all(&text, |captures: &Captures| {
        let slot = match captures[1].to_ascii_lowercase().as_str() {
            "seed" => &mut overrides.seed,
            "steps" => &mut overrides.steps,
            _ => &mut overrides.count,
        };
        match captures[2].parse() {
            Ok(value) => {
                *slot = Some(value);
                String::new()
            }
            Err(_) => captures[0].to_owned(),
        }
    });

    (normalise(&EMPTY_GROUP.replace_all(&text, "")), overrides)
}

/// Collapses runs of whitespace into single spaces and trims the ends.
pub(crate) fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_integer_overrides() {
        let (text, overrides) = extract("cat seed=42 steps=30");

        assert_eq!(text, "cat");
        assert_eq!(overrides.seed, Some(42));
        assert_eq!(overrides.steps, Some(30));
        assert_eq!(overrides.scale, None);
    }

    #[test]
    fn accepts_colon_and_a_single_space() {
        let (text, overrides) = extract("a castle, seed: 7, scale:8.5 at dusk");

        assert_eq!(text, "a castle, , at dusk");
        assert_eq!(overrides.seed, Some(7));
        assert_eq!(overrides.scale, Some(8.5));
    }

    #[test]
    fn later_tokens_win() {
        let (_, overrides) = extract("seed=1 dog seed=2");

        assert_eq!(overrides.seed, Some(2));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let (text, overrides) = extract("Seed=5 owl");

        assert_eq!(text, "owl");
        assert_eq!(overrides.seed, Some(5));
    }

    #[test]
    fn unrecognised_tokens_are_left_in_place() {
        let (text, overrides) = extract("cat style=anime seed=abc");

        assert_eq!(text, "cat style=anime seed=abc");
        assert_eq!(overrides, Overrides::default());
    }

    #[test]
    fn keys_inside_words_are_ignored() {
        let (text, overrides) = extract("upscale=2.0 fox");

        assert_eq!(text, "upscale=2.0 fox");
        assert_eq!(overrides.scale, None);
    }

    #[test]
    fn out_of_range_seed_is_left_in_place() {
        let (text, overrides) = extract("fox seed=99999999999");

        assert_eq!(text, "fox seed=99999999999");
        assert_eq!(overrides.seed, None);
    }

    #[test]
    fn count_is_recognised() {
        let (text, overrides) = extract("fox count=3");

        assert_eq!(text, "fox");
        assert_eq!(overrides.count, Some(3));
    }

    #[test]
    fn empty_groups_are_removed() {
        let (text, _) = extract("portrait (seed=3) | steps=40 | oil");

        assert_eq!(text, "portrait oil");
    }

    #[test]
    fn non_empty_groups_survive() {
        assert_eq!(extract("(red) | blue |").0, "(red) | blue |");
        assert_eq!(extract("a ( ) b").0, "a b");
    }

    #[test]
    fn integer_scale_is_accepted() {
        let (text, overrides) = extract("fox scale=8 steps:25");

        assert_eq!(text, "fox");
        assert_eq!(overrides.scale, Some(8.0));
        assert_eq!(overrides.steps, Some(25));
    }

    #[test]
    fn non_ascii_text_is_preserved() {
        let (text, overrides) = extract("кот seed=3 über");

        assert_eq!(text, "кот über");
        assert_eq!(overrides.seed, Some(3));
    }
}
