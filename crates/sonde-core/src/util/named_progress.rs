use indicatif::ProgressStyle;

/// Extension trait labelling progress bars with the phase they report.
pub trait NamedProgress {
    /// Creates a bar style with a left-aligned `name` label in front of it.
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let template = format!(
            "{name:<31} {{wide_bar:40.cyan/blue}} {{pos:>3}}/{{len:<3}} \
             [{{elapsed_precise}} ({{eta}} remaining)] {{msg}}"
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}
