/// Operator gate for destructive migration steps.
pub trait Confirm {
    /// Asks `question`; `true` means proceed.
    fn confirm(&mut self, question: &str) -> bool;
}

/// Answers yes to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&mut self, question: &str) -> bool {
        log::debug!("auto-confirmed: {question}");
        true
    }
}

/// Answers no to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&mut self, question: &str) -> bool {
        log::debug!("auto-rejected: {question}");
        false
    }
}

impl<F> Confirm for F
where
    F: FnMut(&str) -> bool,
{
    fn confirm(&mut self, question: &str) -> bool {
        self(question)
    }
}
