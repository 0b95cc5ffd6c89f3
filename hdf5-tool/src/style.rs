use hdf5::NodeKind;

// ── ANSI styling ─────────────────────────────────────────────────────────

pub(crate) const RESET: &str = "\x1b[0m";
pub(crate) const BOLD: &str = "\x1b[1m";
pub(crate) const DIM: &str = "\x1b[2m";
pub(crate) const GREEN: &str = "\x1b[32m";
pub(crate) const CYAN: &str = "\x1b[36m";
pub(crate) const BLUE: &str = "\x1b[34m";
pub(crate) const RED: &str = "\x1b[31m";
pub(crate) const WHITE: &str = "\x1b[37m";

// ── Box-drawing ──────────────────────────────────────────────────────────

pub(crate) const PIPE: &str = "│";
pub(crate) const TEE: &str = "├──";
pub(crate) const ELBOW: &str = "└──";
pub(crate) const DASH_LINE: &str = "────────────────────────────────────────────────────────────";
pub(crate) const DOUBLE_LINE: &str = "════════════════════════════════════════════════════════════";

// ── Formatting ───────────────────────────────────────────────────────────

pub(crate) fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

pub(crate) fn format_commas(n: u64) -> String {
    let s = n.to_string();
    let bytes = s.as_bytes();
    let mut result = Vec::new();
    for (i, &b) in bytes.iter().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(b',');
        }
        result.push(b);
    }
    result.reverse();
    String::from_utf8(result).unwrap()
}

pub(crate) fn kind_icon(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Group => "grp",
        NodeKind::Dataset => "   ",
        NodeKind::SoftLink { .. } => "lnk",
    }
}

pub(crate) fn kind_color(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Group => BLUE,
        NodeKind::Dataset => WHITE,
        NodeKind::SoftLink { .. } => CYAN,
    }
}

pub(crate) fn shape_string(dims: &[u64]) -> String {
    if dims.is_empty() {
        "scalar".to_string()
    } else {
        format!(
            "[{}]",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

// ── UI output ────────────────────────────────────────────────────────────

pub(crate) fn header(title: &str) {
    println!();
    println!("  {BOLD}{title}{RESET}");
    println!("  {DIM}{DOUBLE_LINE}{RESET}");
}

pub(crate) fn section(title: &str) {
    println!();
    println!("  {CYAN}{BOLD}{title}{RESET}");
    println!("  {DIM}{DASH_LINE}{RESET}");
}

pub(crate) fn kv(key: &str, value: &str) {
    println!("  {DIM}{key:<24}{RESET} {value}");
}

pub(crate) fn kv_highlight(key: &str, value: &str) {
    println!("  {DIM}{key:<24}{RESET} {BOLD}{GREEN}{value}{RESET}");
}
