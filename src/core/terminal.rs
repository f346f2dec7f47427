use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

/// Renders a plain table with left-aligned, width-fitted columns.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let header = headers
        .iter()
        .zip(&widths)
        .map(|(h, w)| format!("{:<w$}", h, w = *w))
        .collect::<Vec<_>>()
        .join("  ");
    println!("  {}", style(header).bold());
    for row in rows {
        let line = row
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<w$}", c, w = *w))
            .collect::<Vec<_>>()
            .join("  ");
        println!("  {}", line);
    }
}

pub struct GuideSection {
    title: String,
    lines: Vec<String>,
}

impl GuideSection {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            lines: Vec::new(),
        }
    }

    pub fn text(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn command(mut self, usage: &str, about: &str) -> Self {
        self.lines
            .push(format!("{:<38} {}", style(usage).cyan(), style(about).dim()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(format!("{} {}: {}", GEAR, style(label).bold().cyan(), value));
        self
    }

    pub fn bullet(mut self, text: &str) -> Self {
        self.lines.push(format!("{} {}", style("•").dim(), text));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(String::new());
        self
    }

    pub fn print(&self) {
        println!("{}", style(&self.title).bold().underlined());
        for line in &self.lines {
            if line.is_empty() {
                println!();
            } else {
                println!("  {}", line);
            }
        }
        println!();
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "             _              _ _       _   ",
        "  __ _ _   _| |_ ___  _ __ (_) | ___ | |_ ",
        " / _` | | | | __/ _ \\| '_ \\| | |/ _ \\| __|",
        "| (_| | |_| | || (_) | |_) | | | (_) | |_ ",
        " \\__,_|\\__,_|\\__\\___/| .__/|_|_|\\___/ \\__|",
        "                     |_|                  ",
    ];

    // Horizontal gradient from teal to amber.
    let stops: [(u8, u8, u8); 2] = [(45, 212, 191), (251, 191, 36)];
    let max_w = lines.iter().map(|l| l.len()).max().unwrap_or(1) as u32;

    println!();
    for line in lines {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let t = (x as u32 * 1000 / max_w).min(1000);
            let (r, g, b) = lerp_color(stops[0], stops[1], t);
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");
    println!("{}\n", style("Self-tuning maintenance agents.").dim());
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let mix = |x: u8, y: u8| ((x as u32 * (1000 - t) + y as u32 * t) / 1000) as u8;
    (mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
}
