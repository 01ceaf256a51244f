use std::io::IsTerminal;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

const FRAME_INNER_WIDTH: usize = 72;
const KEY_WIDTH: usize = 18;
const LOGO: &[&str] = &[
    "  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,  ,",
    "  |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\ |\\",
    "  ----------------  F A R M H A N D  ----------------",
    "  '  '  '  '  '  '  '  '  '  '  '  '  '  '  '  '  '  '  '",
];

static COLOR_ENABLED: OnceLock<bool> = OnceLock::new();
static LOG_START: OnceLock<Instant> = OnceLock::new();
static OUTPUT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static LOG_SINK: OnceLock<Mutex<Option<LogSink>>> = OnceLock::new();

type LogSink = Arc<dyn Fn(UiLogEvent) + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub(crate) struct UiLogEvent {
    pub elapsed_secs: f64,
    pub level: &'static str,
    pub tag: String,
    pub message: String,
}

#[derive(Clone, Copy)]
enum Level {
    Info,
    Success,
    Warn,
    Error,
    Minted,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Minted => "minted",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "OK",
            Self::Warn => "WARN",
            Self::Error => "ERR",
            Self::Minted => "$$",
        }
    }

    fn level_style(self) -> &'static str {
        match self {
            Self::Info => "48;5;31;1;97",
            Self::Success => "48;5;28;1;97",
            Self::Warn => "48;5;214;1;30",
            Self::Error => "48;5;160;1;97",
            Self::Minted => "48;5;178;1;30",
        }
    }

    fn body_style(self) -> &'static str {
        match self {
            Self::Info => "38;5;153",
            Self::Success => "38;5;120",
            Self::Warn => "38;5;223",
            Self::Error => "38;5;217",
            Self::Minted => "1;38;5;220",
        }
    }

    fn use_stderr(self) -> bool {
        matches!(self, Self::Warn | Self::Error)
    }
}

pub(crate) fn startup_banner(lines: &[(&str, String)]) {
    let colors = use_color();
    println!();
    frame_top(colors);
    for line in LOGO {
        frame_center(line, "38;5;114", colors);
    }
    frame_rule("session", colors);
    for (key, value) in lines {
        frame_kv(key, value, colors);
    }
    frame_bottom(colors);
    println!();
}

pub(crate) fn info(tag: &str, message: impl AsRef<str>) {
    log(Level::Info, tag, message.as_ref());
}

pub(crate) fn success(tag: &str, message: impl AsRef<str>) {
    log(Level::Success, tag, message.as_ref());
}

pub(crate) fn warn(tag: &str, message: impl AsRef<str>) {
    log(Level::Warn, tag, message.as_ref());
}

pub(crate) fn error(tag: &str, message: impl AsRef<str>) {
    log(Level::Error, tag, message.as_ref());
}

pub(crate) fn minted(tag: &str, message: impl AsRef<str>) {
    log(Level::Minted, tag, message.as_ref());
}

pub(crate) fn set_log_sink(sink: Option<Arc<dyn Fn(UiLogEvent) + Send + Sync + 'static>>) {
    let mut slot = lock(log_sink_lock());
    *slot = sink;
}

fn log(level: Level, tag: &str, message: &str) {
    let elapsed_secs = log_elapsed().as_secs_f64();
    emit_log_sink(UiLogEvent {
        elapsed_secs,
        level: level.as_str(),
        tag: tag.to_string(),
        message: message.to_string(),
    });

    let colors = use_color();
    let time_plain = format!("{:>7.1}s", elapsed_secs);
    let level_plain = format!(" {:^4} ", level.label());
    let tag_plain = format!(" {:<8} ", tag);
    let prefix_plain = format!("{time_plain} {level_plain} {tag_plain}");
    let prefix = format!(
        "{} {} {}",
        paint(&time_plain, "2;37", colors),
        paint(&level_plain, level.level_style(), colors),
        paint(&tag_plain, "48;5;236;1;250", colors),
    );
    let max_body = if output_is_terminal() {
        terminal_columns()
            .saturating_sub(prefix_plain.chars().count() + 1)
            .max(16)
    } else {
        usize::MAX
    };
    let constrained = constrain_line(message, max_body);
    let body = style_message(&constrained, level.body_style(), colors);

    let _out_guard = lock(output_lock());
    if level.use_stderr() {
        eprintln!("{prefix} {body}");
    } else {
        println!("{prefix} {body}");
    }
}

fn emit_log_sink(event: UiLogEvent) {
    let sink = {
        let slot = lock(log_sink_lock());
        slot.clone()
    };
    if let Some(sink) = sink {
        sink(event);
    }
}

fn log_sink_lock() -> &'static Mutex<Option<LogSink>> {
    LOG_SINK.get_or_init(|| Mutex::new(None))
}

fn frame_top(colors: bool) {
    println!(
        "{}{}{}",
        paint("╭", "1;32", colors),
        paint(&"─".repeat(FRAME_INNER_WIDTH), "1;32", colors),
        paint("╮", "1;32", colors),
    );
}

fn frame_bottom(colors: bool) {
    println!(
        "{}{}{}",
        paint("╰", "1;32", colors),
        paint(&"─".repeat(FRAME_INNER_WIDTH), "1;32", colors),
        paint("╯", "1;32", colors),
    );
}

fn frame_rule(label: &str, colors: bool) {
    let label = format!(" {} ", label.to_ascii_uppercase());
    let side = FRAME_INNER_WIDTH.saturating_sub(label.chars().count()) / 2;
    let right = FRAME_INNER_WIDTH
        .saturating_sub(label.chars().count())
        .saturating_sub(side);
    frame_row(
        &format!("{}{}{}", "─".repeat(side), label, "─".repeat(right)),
        "38;5;114",
        colors,
    );
}

fn frame_center(text: &str, style: &str, colors: bool) {
    let clipped = clip(text, FRAME_INNER_WIDTH);
    frame_row(
        &format!("{:^width$}", clipped, width = FRAME_INNER_WIDTH),
        style,
        colors,
    );
}

fn frame_kv(key: &str, value: &str, colors: bool) {
    let key_text = format!("{:<width$}", format!("{key}:"), width = KEY_WIDTH);
    let max_value = FRAME_INNER_WIDTH.saturating_sub(2 + KEY_WIDTH + 1);
    let value_text = clip(value, max_value);
    let used = 2 + key_text.chars().count() + 1 + value_text.chars().count();
    let padding = " ".repeat(FRAME_INNER_WIDTH.saturating_sub(used));

    println!(
        "{}  {} {}{}{}",
        paint("│", "1;32", colors),
        paint(&key_text, "1;96", colors),
        paint(&value_text, "1;97", colors),
        padding,
        paint("│", "1;32", colors),
    );
}

fn frame_row(text: &str, style: &str, colors: bool) {
    let row = format!(
        "{:<width$}",
        clip(text, FRAME_INNER_WIDTH),
        width = FRAME_INNER_WIDTH
    );
    println!(
        "{}{}{}",
        paint("│", "1;32", colors),
        paint(&row, style, colors),
        paint("│", "1;32", colors),
    );
}

fn style_message(message: &str, base_style: &str, colors: bool) -> String {
    if !colors || message.is_empty() {
        return message.to_string();
    }

    let mut styled = String::with_capacity(message.len() + 32);
    for part in message.split_inclusive(char::is_whitespace) {
        let token = part.trim_end_matches(char::is_whitespace);
        let whitespace = &part[token.len()..];
        if !token.is_empty() {
            styled.push_str(&style_token(token, base_style, colors));
        }
        styled.push_str(whitespace);
    }
    styled
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TokenKind {
    Separator,
    KeyValue,
    Address,
    Amount,
    Plain,
}

fn classify_token(core: &str) -> TokenKind {
    if core == "|" {
        return TokenKind::Separator;
    }
    if core
        .split_once('=')
        .is_some_and(|(key, value)| !key.is_empty() && !value.is_empty())
    {
        return TokenKind::KeyValue;
    }
    if let Some(hex) = core.strip_prefix("0x") {
        if !hex.is_empty() && hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return TokenKind::Address;
        }
    }
    let digits = core.trim_start_matches(['+', '~']);
    if digits.starts_with(|ch: char| ch.is_ascii_digit())
        && digits.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
    {
        return TokenKind::Amount;
    }
    TokenKind::Plain
}

fn style_token(token: &str, base_style: &str, colors: bool) -> String {
    let (core, suffix) = split_trailing_punctuation(token);
    let suffix = maybe_paint(suffix, "2;37", colors);
    match classify_token(core) {
        TokenKind::Separator => paint("│", "2;37", colors),
        TokenKind::KeyValue => {
            let (key, value) = core.split_once('=').unwrap_or((core, ""));
            format!(
                "{}{}{}{suffix}",
                paint(key, "1;94", colors),
                paint("=", "2;37", colors),
                paint(value, "1;97", colors),
            )
        }
        TokenKind::Address => format!("{}{suffix}", paint(core, "38;5;180", colors)),
        TokenKind::Amount => format!("{}{suffix}", paint(core, "1;96", colors)),
        TokenKind::Plain => format!("{}{suffix}", paint(core, base_style, colors)),
    }
}

fn split_trailing_punctuation(token: &str) -> (&str, &str) {
    let trimmed = token.trim_end_matches([',', ';', ')', ']', '}']);
    token.split_at(trimmed.len())
}

fn clip(text: &str, max_width: usize) -> String {
    if max_width == 0 {
        return String::new();
    }
    if text.chars().count() <= max_width {
        return text.to_string();
    }
    text.chars().take(max_width).collect()
}

fn log_elapsed() -> std::time::Duration {
    LOG_START.get_or_init(Instant::now).elapsed()
}

fn use_color() -> bool {
    *COLOR_ENABLED.get_or_init(|| {
        if let Some(force) = std::env::var_os("CLICOLOR_FORCE") {
            if force.to_string_lossy() != "0" {
                return true;
            }
        }
        if std::env::var_os("NO_COLOR").is_some() {
            return false;
        }
        if let Some(choice) = std::env::var_os("CLICOLOR") {
            if choice.to_string_lossy() == "0" {
                return false;
            }
        }
        if std::env::var("TERM")
            .map(|term| term.eq_ignore_ascii_case("dumb"))
            .unwrap_or(false)
        {
            return false;
        }
        output_is_terminal()
    })
}

fn output_is_terminal() -> bool {
    std::io::stdout().is_terminal() || std::io::stderr().is_terminal()
}

fn terminal_columns() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|cols| *cols >= 60)
        .unwrap_or(120)
}

fn constrain_line(message: &str, max_chars: usize) -> String {
    if max_chars == usize::MAX || message.chars().count() <= max_chars {
        return message.to_string();
    }
    if max_chars <= 3 {
        return ".".repeat(max_chars);
    }
    let keep = max_chars - 3;
    let mut out = String::with_capacity(max_chars);
    out.push_str(&message.chars().take(keep).collect::<String>());
    out.push_str("...");
    out
}

fn paint(text: &str, style: &str, enabled: bool) -> String {
    if enabled {
        format!("\x1b[{style}m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

fn maybe_paint(text: &str, style: &str, enabled: bool) -> String {
    if text.is_empty() {
        String::new()
    } else {
        paint(text, style, enabled)
    }
}

fn output_lock() -> &'static Mutex<()> {
    OUTPUT_LOCK.get_or_init(|| Mutex::new(()))
}

fn lock<T>(mutex: &'static Mutex<T>) -> MutexGuard<'static, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
