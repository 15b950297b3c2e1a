use std::io::{self, BufRead, Write};

use knobs_migrate::Confirm;

/// Asks on stderr and reads the answer from stdin. Only `y` or `yes`
/// proceed; end of input counts as no.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{question} (yes/no) [no]: ");
        let _ = stderr.flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => is_yes(&answer),
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
