//! Caption texts attached to delivered images.
use crate::job::Job;

pub const SOCIAL_TAGS: &str = "#aiart #stablediffusion";
pub const HEADLINE_TAGS: &str = "#AIart #stablediffusion";
pub const PLACEHOLDER: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub prompt: String,
    pub seed: u32,
    pub scale: f64,
    pub steps: u32,
}

impl From<&Job> for Caption {
    fn from(job: &Job) -> Self {
        Self {
            prompt: job.prompt.clone(),
            seed: job.params.seed,
            scale: job.params.scale,
            steps: job.params.steps,
        }
    }
}

impl Caption {
    /// `prompt`, then the parameters on a second line.
    pub fn primary(&self) -> String {
        format!(
            "{}\nseed: {} | scale: {} | steps: {}",
            self.prompt,
            self.seed,
            format_scale(self.scale),
            self.steps
        )
    }

    pub fn social(&self) -> String {
        social(&self.primary())
    }

    pub fn headline(&self, width: usize) -> String {
        headline(&self.primary(), width)
    }
}

/// Appends the social tags to a caption text.
pub fn social(text: &str) -> String {
    format!("{text}\n{SOCIAL_TAGS}")
}

/// The first line of a caption text with tags, shortened on word boundaries to `width`
/// characters.
pub fn headline(text: &str, width: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    shorten(&format!("{first_line}\n{HEADLINE_TAGS}"), width, PLACEHOLDER)
}

fn format_scale(scale: f64) -> String {
    if scale.fract() == 0.0 {
        format!("{scale:.1}")
    } else {
        scale.to_string()
    }
}

/// Collapses whitespace and, if the text is longer than `width` characters, keeps as many whole
/// words as fit together with `placeholder`.
pub fn shorten(text: &str, width: usize, placeholder: &str) -> String {
    let words = text.split_whitespace().collect::<Vec<_>>();
    let collapsed = words.join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }

    let budget = width.saturating_sub(placeholder.chars().count());
    let mut kept = String::new();
    for word in words {
        let separator = usize::from(!kept.is_empty());
        if kept.chars().count() + separator + word.chars().count() > budget {
            break;
        }
        if separator == 1 {
            kept.push(' ');
        }
        kept.push_str(word);
    }
    if kept.is_empty() {
        placeholder.trim_start().chars().take(width).collect()
    } else {
        kept + placeholder
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn caption(prompt: &str) -> Caption {
        Caption {
            prompt: prompt.to_owned(),
            seed: 42,
            scale: 8.0,
            steps: 30,
        }
    }

    #[test]
    fn primary_caption() {
        assert_eq!(
            caption("a red fox").primary(),
            "a red fox\nseed: 42 | scale: 8.0 | steps: 30"
        );
        let mut fractional = caption("owl");
        fractional.scale = 7.3;
        assert!(fractional.primary().ends_with("scale: 7.3 | steps: 30"));
    }

    #[test]
    fn social_caption_has_tags() {
        assert!(caption("fox").social().ends_with("\n#aiart #stablediffusion"));
    }

    #[test]
    fn short_headline_is_not_truncated() {
        assert_eq!(caption("fox").headline(280), "fox #AIart #stablediffusion");
    }

    #[test]
    fn long_headline_is_cut_on_word_boundary() {
        let prompt = "word ".repeat(100);
        let headline = caption(&prompt).headline(50);

        assert!(headline.chars().count() <= 50);
        assert!(headline.ends_with("word..."));
    }

    #[test]
    fn shorten_with_overlong_first_word() {
        assert_eq!(shorten("abcdefghij klm", 5, "..."), "...");
        assert_eq!(shorten("a b c d", 7, "..."), "a b c d");
        assert_eq!(shorten("one two three", 10, "..."), "one two...");
    }
}
