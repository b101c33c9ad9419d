//! Terminal styling utilities

pub fn style_cyan(s: &str) -> String {
    format!("\x1b[36m{}\x1b[0m", s)
}

pub fn style_green(s: &str) -> String {
    format!("\x1b[32m{}\x1b[0m", s)
}

pub fn style_red(s: &str) -> String {
    format!("\x1b[31m{}\x1b[0m", s)
}

pub fn style_yellow(s: &str) -> String {
    format!("\x1b[33m{}\x1b[0m", s)
}

pub fn style_dim(s: &str) -> String {
    format!("\x1b[2m{}\x1b[0m", s)
}

pub fn style_bold(s: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", s)
}

pub fn print_success(msg: &str) {
    println!("{} {}", style_green("✓"), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", style_red("✗"), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", style_cyan("ℹ"), msg);
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", style_bold(title));
    println!("{}", "─".repeat(title.chars().count()));
}

/// `0x1234...abcd` form of an address for tables
pub fn short_address(address: &str) -> String {
    if address.len() >= 12 && address.is_ascii() {
        format!("{}...{}", &address[..6], &address[address.len() - 4..])
    } else {
        address.to_string()
    }
}

/// Text progress bar, `width` cells wide
pub fn progress_bar(progress: u64, required: u64, width: usize) -> String {
    let filled = if required == 0 {
        width
    } else {
        ((progress.min(required) as f64 / required as f64) * width as f64).round() as usize
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}
