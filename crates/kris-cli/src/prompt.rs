use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, bail};

/// Reads one non-empty line from stdin after printing `label: `.
pub fn ask(label: &str) -> Result<String> {
    let stdin = io::stdin();
    loop {
        print!("{label}: ");
        io::stdout().flush().context("failed to flush stdout")?;
        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .context("failed to read from stdin")?;
        if read == 0 {
            bail!("stdin closed while reading {label}");
        }
        let value = line.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
}

/// Like [`ask`], without echoing the input.
pub fn ask_secret(label: &str) -> Result<String> {
    loop {
        let value = rpassword::prompt_password(format!("{label}: "))
            .with_context(|| format!("failed to read {label}"))?;
        let value = value.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
}
