use std::io::{self, BufRead, Write};

use crate::core::RiskLevel;
use crate::platform::UserPrompt;

/// Asks on stderr and reads the answer from stdin. EOF counts as "no".
#[derive(Debug, Clone, Default)]
pub(crate) struct TerminalPrompt;

impl UserPrompt for TerminalPrompt {
    fn confirm(&self, risk: RiskLevel, message: &str) -> bool {
        let question = format!(
            "This plan includes {risk} ({}) steps. Type 'yes' to continue: ",
            risk.label()
        );
        ask(message, &question, "yes").unwrap_or(false)
    }

    fn confirm_with_phrase(&self, phrase: &str, message: &str) -> bool {
        let question = format!(
            "This plan includes destructive steps. Type '{phrase}' to continue: "
        );
        ask(message, &question, phrase).unwrap_or(false)
    }
}

fn ask(message: &str, question: &str, expected: &str) -> io::Result<bool> {
    {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{message}")?;
        write!(stderr, "{question}")?;
        stderr.flush()?;
    }

    let mut input = String::new();
    let n = io::stdin().lock().read_line(&mut input)?;
    if n == 0 {
        return Ok(false);
    }
    Ok(answer_matches(&input, expected))
}

/// Exact match apart from the line ending; case and inner spacing count.
fn answer_matches(input: &str, expected: &str) -> bool {
    input.trim_end_matches(['\r', '\n']).trim() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_must_match_exactly() {
        assert!(answer_matches("yes\n", "yes"));
        assert!(answer_matches("  WIPE BOOT PARTITION\r\n", "WIPE BOOT PARTITION"));
        assert!(!answer_matches("y\n", "yes"));
        assert!(!answer_matches("wipe boot partition\n", "WIPE BOOT PARTITION"));
        assert!(!answer_matches("WIPE  BOOT PARTITION\n", "WIPE BOOT PARTITION"));
    }
}
