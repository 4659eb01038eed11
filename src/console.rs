//! Colored console reporting.
//!
//! These lines are the user-facing verdicts of each operation. They go to stdout and are
//! independent of the `tracing` log file.

const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

const PASS_BANNER: &str = r#"
 ______  ____    _____ ______      ____    ____    _____ _____
/\__  _\/\  _`\ /\  __`\__  _\    /\  _`\ /\  _`\ /\  __`\  __`\
\/_/\ \/\ \ \L\_\ \,\L\_\/\ \/    \ \ \L\ \ \ \L\ \ \,\L\_\,\L\_\
   \ \ \ \ \  _\L\/_\__ \ \ \ \     \ \ ,__/\ \  __ \/_\__ \/_\__ \
    \ \ \ \ \ \L\ \/\ \L\ \\ \ \     \ \ \/  \ \ \/\ \/\ \L\ \/\ \L\ \
     \ \_\ \ \____/\ `\____\\ \_\     \ \_\   \ \_\ \_\ `\____\ `\____\
      \/_/  \/___/  \/_____/ \/_/      \/_/    \/_/\/_/\/_____/\/_____/
"#;

const FAIL_BANNER: &str = r#"
 ______  ____    _____ ______      ____    ______  ______  __
/\__  _\/\  _`\ /\  __`\__  _\    /\  _`\ /\  _  \/\__  _\/\ \
\/_/\ \/\ \ \L\_\ \,\L\_\/\ \/    \ \ \L\_\ \ \L\ \/_/\ \/\ \ \
   \ \ \ \ \  _\L\/_\__ \ \ \ \     \ \  _\/\ \  __ \ \ \ \ \ \ \  __
    \ \ \ \ \ \L\ \/\ \L\ \\ \ \     \ \ \/  \ \ \/\ \ \_\ \_\ \ \L\ \
     \ \_\ \ \____/\ `\____\\ \_\     \ \_\   \ \_\ \_\/\_____\ \____/
      \/_/  \/___/  \/_____/ \/_/      \/_/    \/_/\/_/\/_____/\/___/
"#;

fn paint(color: &str, msg: &str) -> String {
    format!("{BOLD}{color}{msg}{RESET}")
}

/// `msg` in bold green.
pub fn green(msg: &str) -> String {
    paint(GREEN, msg)
}

/// Print a bold green line.
pub fn ok(msg: &str) {
    println!("{}", green(msg));
}

/// Print a bold yellow line.
pub fn warn(msg: &str) {
    println!("{}", paint(YELLOW, msg));
}

/// Print a bold red line.
pub fn err(msg: &str) {
    println!("{}", paint(RED, msg));
}

/// The "TEST PASS" banner, green.
pub fn pass_banner() -> String {
    paint(GREEN, PASS_BANNER)
}

/// The "TEST FAIL" banner, red.
pub fn fail_banner() -> String {
    paint(RED, FAIL_BANNER)
}

/// Print every cause of `error`, outermost first, in red.
pub fn print_error_chain(error: &anyhow::Error) {
    err(&error.to_string());
    for cause in error.chain().skip(1) {
        err(&format!("  caused by: {cause}"));
    }
}
