//! Facts recovered from the wrapped program's command line.
//!
//! `args` always includes the program name at index 0.

use std::sync::OnceLock;

use regex::Regex;

const MODEL_FLAGS: [&str; 2] = ["-m", "--model"];

fn is_uuid(arg: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").ok()
        })
        .as_ref()
        .is_some_and(|re| re.is_match(arg))
}

/// Model named by `-m <m>`, `--model <m>` or `--model=<m>`.
pub fn detect_model(args: &[String]) -> Option<String> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if MODEL_FLAGS.contains(&arg.as_str()) {
            return iter.next().cloned();
        }
        if let Some(model) = arg.strip_prefix("--model=") {
            return Some(model.to_string());
        }
    }
    None
}

/// The wrapped program's own session UUID when it is being resumed
/// (`<prog> resume <uuid>`).
pub fn detect_resume_uuid(args: &[String]) -> Option<String> {
    if !args.iter().skip(1).any(|a| a == "resume") {
        return None;
    }
    args.iter()
        .skip(1)
        .find(|a| is_uuid(a))
        .cloned()
}

/// First positional argument after the program, or `interactive`.
pub fn subcommand(args: &[String]) -> String {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if MODEL_FLAGS.contains(&arg.as_str()) {
            iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            return arg.clone();
        }
    }
    "interactive".to_string()
}
