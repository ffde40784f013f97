//! Operator confirmation prompt.
//!
//! Caps the answer to a bounded length and treats anything longer as a
//! fresh re-prompt rather than reading past the buffer.

use std::io::{BufRead, Write};

const MAX_ANSWER_LEN: usize = 8;

/// prompts on `stderr`, reads from `stdin`. Returns `Ok(true)` only for an
/// explicit `y`/`yes` (case-insensitive); anything else, including EOF, is
/// a "no".
pub fn confirm(question: &str) -> std::io::Result<bool> {
    confirm_with(
        question,
        &mut std::io::stdin().lock(),
        &mut std::io::stderr(),
    )
}

pub fn confirm_with(
    question: &str,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> std::io::Result<bool> {
    loop {
        write!(output, "{question} [y/N] ")?;
        output.flush()?;

        let mut line = String::new();
        let read = input.read_line(&mut line)?;
        if read == 0 {
            return Ok(false); // EOF: default to no.
        }

        let answer = line.trim();
        if answer.len() > MAX_ANSWER_LEN {
            writeln!(output, "answer too long, try again")?;
            continue;
        }
        match answer.to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" | "" => return Ok(false),
            _ => {
                writeln!(output, "please answer y or n")?;
                continue;
            }
        }
    }
}
