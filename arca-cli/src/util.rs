//! Small shared helpers for the subcommands.

use anyhow::{bail, Context, Result};
use arca::Passphrase;

use std::io::Read;
use std::path::Path;

/// Reads the passphrase from a file (`-` meaning standard input), or
/// prompts for it twice on the terminal
pub fn read_passphrase(file: Option<&Path>, prompt: &str) -> Result<Passphrase> {
    match file {
        Some(path) if path.as_os_str() == "-" => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading passphrase from stdin")?;
            Ok(Passphrase::from(first_line(&text)))
        }
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading passphrase file {}", path.display()))?;
            Ok(Passphrase::from(first_line(&text)))
        }
        None => {
            let entered = rpassword::prompt_password(prompt).context("reading passphrase")?;
            let confirmed =
                rpassword::prompt_password("Enter again for verification: ")
                    .context("reading passphrase")?;
            if entered != confirmed {
                bail!("passphrase mismatch");
            }
            Ok(Passphrase::from(entered))
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim_end_matches('\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_passphrases_take_the_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pass");
        std::fs::write(&path, "secret word\nsecond line\n").unwrap();
        let passphrase = read_passphrase(Some(&path), "unused").unwrap();
        assert_eq!(passphrase.as_bytes(), b"secret word");
    }
}
