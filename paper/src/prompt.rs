//! Terminal prompts for the operator.
use libpaper::{HashSite, Operator, SiteSelection};
use std::io::{self, BufRead, Write};

pub struct TerminalOperator {
    /// Answer yes to every confirmation without asking.
    pub assume_yes: bool,
}

/// Prints `prompt` and reads one line. `None` on end of input.
fn ask(prompt: &str) -> Option<String> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// A typed password with surrounding whitespace dropped; `None` if nothing
/// is left.
pub fn secret(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl Operator for TerminalOperator {
    fn request_secret(&self, prompt: &str) -> Option<String> {
        ask(&format!("{prompt}: "))
    }

    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            info!("{question} yes (--yes)");
            return true;
        }
        ask(&format!("{question} [y/N] "))
            .is_some_and(|a| matches!(a.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }

    fn choose_site(&self, sites: &[HashSite]) -> SiteSelection {
        if sites.len() < 2 || self.assume_yes {
            return SiteSelection::First;
        }
        for (i, site) in sites.iter().enumerate() {
            println!("  [{i}] {} hash at offset {:#x}", site.kind, site.offset);
        }
        loop {
            let Some(answer) = ask("Site to patch [0]: ") else {
                return SiteSelection::First;
            };
            let answer = answer.trim();
            if answer.is_empty() {
                return SiteSelection::First;
            }
            match answer.parse::<usize>() {
                Ok(i) if i < sites.len() => return SiteSelection::Index(i),
                _ => warn!("enter a number between 0 and {}", sites.len() - 1),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_whitespace() {
        assert_eq!(None, secret(""));
        assert_eq!(None, secret(" \t  "));
        assert_eq!(Some("newpass".to_string()), secret("  newpass \r"));
        assert_eq!(Some("two words".to_string()), secret("two words "));
    }
}
