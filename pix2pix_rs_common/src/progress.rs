use indicatif::{ProgressBar, ProgressBarIter, ProgressIterator, ProgressStyle};

/// Wrap an iterator in a progress bar labelled `.1`, drawn in `COLOR` (`b`, `g` or `r`).
pub struct NiceProgressBar<T: ExactSizeIterator, const COLOR: char = 'b'>(pub T, pub &'static str);

fn style(label: &str, color: char) -> ProgressStyle {
    let color = match color {
        'g' => "green",
        'r' => "red",
        _ => "blue",
    };
    ProgressStyle::default_bar()
        .template(&format!(
            "{label}: [{{elapsed_precise}}] [{{bar:40.{color}/{color}}}] {{pos}}/{{len}} ({{eta}})"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

impl<T: ExactSizeIterator, const COLOR: char> IntoIterator for NiceProgressBar<T, COLOR> {
    type IntoIter = ProgressBarIter<T>;
    type Item = T::Item;

    fn into_iter(self) -> Self::IntoIter {
        let bar = ProgressBar::new(self.0.len() as u64);
        bar.set_style(style(self.1, COLOR));
        bar.wrap_iter(self.0)
    }
}

pub trait IterWithProgress<T: ExactSizeIterator> {
    /// Attach a progress bar unless `silent` is set.
    fn with_progress(self, label: &'static str, silent: bool) -> ProgressBarIter<T>;
}

impl<T: ExactSizeIterator> IterWithProgress<T> for T {
    fn with_progress(self, label: &'static str, silent: bool) -> ProgressBarIter<T> {
        if silent {
            self.progress_with(ProgressBar::hidden())
        } else {
            NiceProgressBar::<_, 'g'>(self, label).into_iter()
        }
    }
}
