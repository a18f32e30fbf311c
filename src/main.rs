//! # gitprune
//!
//! A CLI tool that merges a template ignore file (for example a stock GitHub
//! `.gitignore` template) with a project-specific ignore file, dropping every
//! project entry the template already covers.
//!
//! ## Overview
//!
//! The template is never reordered or rewritten. Project entries the template
//! does not already contain are added after it, either in a trailing
//! "Project-specific entries" section or, with `--placement section`, under
//! the template heading they thematically belong to.
//!
//! ## Key Components
//!
//! - **Line Classification**: Lines are Blank, Comment (`#`), or Entry.
//! - **Match Policies**: `exact` compares trimmed entries verbatim; `loose`
//!   ignores punctuation and case (`node_modules/` == `node_modules`).
//! - **Placement Policies**: `append` adds one trailing section carrying the
//!   project's own comments; `section` slots entries under related headings.
//! - **Input Validation**: empty inputs are rejected before merging.
//!
//! ## Algorithm Flow
//!
//! ```text
//! Template ─┐
//!           ├→ Validate → Collect template keys → Filter project lines → Place → Output
//! Project ──┘
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (file not found, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: new entries would be added |
//! | 4 | Parse error (invalid UTF-8 or binary input) |
//! | 5 | Validation error (empty template or project) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: new entries would be added
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
    /// Validation error (template or project is empty)
    pub const VALIDATION_ERROR: i32 = 5;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Rejection of the inputs before a merge is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValidationError {
    /// Neither input has any non-whitespace content
    BothEmpty,
    /// The template has no non-whitespace content
    TemplateEmpty,
    /// The project file has no non-whitespace content
    ProjectEmpty,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::BothEmpty => "Both inputs cannot be empty",
            Self::TemplateEmpty => "Template cannot be empty",
            Self::ProjectEmpty => "Project ignore file cannot be empty",
        };
        f.write_str(message)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else if error_chain_has::<ValidationError>(err) {
        exit_codes::VALIDATION_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// How two entries are decided to be duplicates of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MatchPolicy {
    /// Trimmed entries must be identical
    #[default]
    Exact,
    /// Ignore punctuation, wildcards and case when comparing
    Loose,
}

impl MatchPolicy {
    /// Comparison key for an entry line under this policy.
    fn key(self, entry: &str) -> String {
        let trimmed = entry.trim();
        match self {
            Self::Exact => trimmed.to_string(),
            Self::Loose => {
                let key = loose_key(trimmed);
                // Punctuation-only entries like "*" would all collapse to ""
                if key.is_empty() {
                    trimmed.to_string()
                } else {
                    key
                }
            }
        }
    }
}

/// Where entries missing from the template end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Placement {
    /// Add a trailing section with the project's remaining lines
    #[default]
    Append,
    /// Insert entries under the most related template heading
    Section,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Merge a template ignore file with a project ignore file, dropping duplicates
#[derive(Parser, Debug)]
#[command(
    name = "gitprune",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (file not found, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: new entries would be added\n  4  Parse error (invalid UTF-8 or binary input)\n  5  Validation error (empty template or project)\n"
)]
struct Args {
    /// Template ignore file. Use "-" to read from stdin.
    #[arg(value_name = "TEMPLATE")]
    template: Option<PathBuf>,

    /// Project-specific ignore file. Use "-" to read from stdin.
    #[arg(value_name = "PROJECT")]
    project: Option<PathBuf>,

    /// Path to config file (default: search for .gitprunerc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Write the merged result to FILE instead of stdout
    #[arg(short = 'o', long, value_name = "FILE", conflicts_with = "in_place")]
    output: Option<PathBuf>,

    /// Overwrite the template file with the merged result
    #[arg(short = 'i', long)]
    in_place: bool,

    /// Create backup file before in-place editing
    #[arg(long, requires = "in_place")]
    backup: bool,

    /// Extension for backup files (default: .bak)
    #[arg(long, default_value = ".bak", requires = "backup")]
    backup_ext: String,

    /// Duplicate detection policy
    #[arg(short = 'p', long, value_enum, default_value = "exact")]
    policy: MatchPolicy,

    /// Where new entries are placed in the merged result
    #[arg(long, value_enum, default_value = "append")]
    placement: Placement,

    /// Heading line for the section holding new entries
    #[arg(long, default_value = DEFAULT_HEADING)]
    heading: String,

    /// Show unified diff of template against the merged result
    #[arg(short = 'd', long)]
    diff: bool,

    /// List new entries without writing anything (exit 0=nothing new, 3=would add)
    #[arg(short = 'n', long, conflicts_with_all = ["in_place", "output"])]
    dry_run: bool,

    /// Output results as JSON for programmatic processing
    #[arg(long, conflicts_with_all = ["verbose", "diff", "highlight"])]
    json: bool,

    /// Render the merged result with new entries marked
    #[arg(short = 'H', long, conflicts_with_all = ["diff", "dry_run", "in_place", "output"])]
    highlight: bool,

    /// Watch both inputs and rewrite --output whenever either changes
    #[arg(
        short = 'w',
        long,
        requires = "output",
        conflicts_with_all = ["in_place", "diff", "dry_run", "json", "highlight"]
    )]
    watch: bool,

    /// Debounce interval in milliseconds (for --watch mode)
    #[arg(long, default_value = "500", requires = "watch")]
    debounce_ms: u64,

    /// Verbose output showing merge progress
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .gitprunerc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args
#[derive(Debug)]
struct Config {
    policy: MatchPolicy,
    placement: Placement,
    heading: String,
    color: ColorMode,
    verbose: bool,
    diff: bool,
    dry_run: bool,
    json: bool,
    highlight: bool,
    watch: bool,
    debounce_ms: u64,
    backup: bool,
    backup_ext: String,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            policy: args.policy,
            placement: args.placement,
            heading: args.heading.clone(),
            color: args.color,
            verbose: args.verbose,
            diff: args.diff,
            dry_run: args.dry_run,
            json: args.json,
            highlight: args.highlight,
            watch: args.watch,
            debounce_ms: args.debounce_ms,
            backup: args.backup,
            backup_ext: args.backup_ext.clone(),
        }
    }
}

impl Config {
    fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            policy: self.policy,
            placement: self.placement,
            heading: self.heading.clone(),
        }
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn added(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Escape console markup in user-supplied text.
///
/// Ignore patterns routinely contain brackets (`*.py[cod]`), which the
/// console would otherwise read as style tags. Backslashes directly before a
/// bracket are doubled so they print literally instead of cancelling the
/// escape.
fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut backslashes = 0;
    for c in text.chars() {
        match c {
            '\\' => backslashes += 1,
            '[' => {
                out.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                out.push('[');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat_n('\\', backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat_n('\\', backslashes));
    out
}

/// Print a merge statistics summary
fn print_stats_summary(stats: &Stats, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} in template, {} in project",
        styles.stat_label("Entries:"),
        stats.template_entries,
        stats.project_entries
    ));

    console.print(&format!(
        "  {} {} dropped as duplicates",
        styles.stat_label("Duplicates:"),
        stats.duplicates_dropped
    ));

    console.print(&format!(
        "  {} {}",
        styles.stat_label("New entries:"),
        stats.new_entries
    ));

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms",
        styles.stat_label("Time:"),
        elapsed_ms
    ));

    console.print("");
}

fn forced_color_console() -> Console {
    let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
    Console::builder()
        .force_terminal(true)
        .color_system(system)
        .build()
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => (forced_color_console(), VerboseStyle::new(true)),
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                return (Console::new(), VerboseStyle::new(false));
            }

            if std::env::var("FORCE_COLOR").is_ok() {
                return (forced_color_console(), VerboseStyle::new(true));
            }

            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".gitprunerc", ".gitprunerc.toml", "gitprunerc.toml"];

/// Configuration loaded from a .gitprunerc file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Duplicate detection policy: exact, loose
    policy: Option<MatchPolicy>,
    /// Placement policy: append, section
    placement: Option<Placement>,
    /// Heading for the project-specific section
    heading: Option<String>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
    /// Create backup before in-place edit
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
}

/// Search for a config file starting from the given directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        for filename in CONFIG_FILENAMES {
            let config_path = current.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    if let Some(home) = dirs::home_dir() {
        for filename in CONFIG_FILENAMES {
            let config_path = home.join(filename);
            if config_path.exists() {
                return Some(config_path);
            }
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Directory the config search starts from: the template's directory, else cwd
fn config_search_dir(args: &Args) -> PathBuf {
    args.template
        .as_ref()
        .filter(|p| !is_stdin(p))
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let config = apply_config_file(args)?;
    validate_heading(&config.heading)?;
    Ok(config)
}

/// A heading that is not a comment would be read back as an entry
fn validate_heading(heading: &str) -> Result<()> {
    if !heading.trim_start().starts_with('#') {
        return Err(ArgError(format!(
            "heading must be a comment line starting with '#', got {:?}",
            heading
        ))
        .into());
    }
    Ok(())
}

fn apply_config_file(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        find_config_file(&config_search_dir(args))
    };

    let Some(path) = config_path else {
        return Ok(config);
    };
    let file_config = load_config_file(&path)?;

    // File values only apply where the CLI kept its default
    if args.policy == MatchPolicy::default() {
        if let Some(policy) = file_config.policy {
            config.policy = policy;
        }
    }

    if args.placement == Placement::default() {
        if let Some(placement) = file_config.placement {
            config.placement = placement;
        }
    }

    if args.heading == DEFAULT_HEADING {
        if let Some(heading) = file_config.heading {
            config.heading = heading;
        }
    }

    if !args.verbose {
        if let Some(v) = file_config.verbose {
            config.verbose = v;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !args.json {
        if let Some(j) = file_config.json {
            config.json = j;
        }
    }

    if !args.backup {
        if let Some(b) = file_config.backup {
            config.backup = b;
        }
    }

    if args.backup_ext == ".bak" {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r##"# .gitprunerc - gitprune configuration file

# Duplicate detection: "exact" (trimmed text must match) or
# "loose" (ignore punctuation, wildcards and case)
policy = "exact"

# Placement of new entries: "append" (trailing section) or
# "section" (under the most related template heading)
placement = "append"

# Heading line for the project-specific section
# heading = "# Project-specific entries"

# Output options
# verbose = false
# color = "auto"
# json = false

# Backup options (for --in-place)
# backup = false
# backup_ext = ".bak"
"##;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init { global } => {
            let path = if *global {
                dirs::home_dir()
                    .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
                    .join(".gitprunerc")
            } else {
                PathBuf::from(".gitprunerc")
            };

            if path.exists() {
                return Err(anyhow::anyhow!(
                    "Config file already exists: {}",
                    path.display()
                ));
            }

            fs::write(&path, DEFAULT_CONFIG)
                .with_context(|| format!("Failed to create config file: {}", path.display()))?;

            eprintln!("Created config file: {}", path.display());
            Ok(())
        }

        ConfigAction::Show => {
            let args = Args::parse_from(["gitprune"]);
            let config = create_config(&args)?;

            eprintln!("Effective configuration:");
            eprintln!("  policy: {:?}", config.policy);
            eprintln!("  placement: {:?}", config.placement);
            eprintln!("  heading: {}", config.heading);
            eprintln!("  verbose: {}", config.verbose);
            eprintln!("  color: {:?}", config.color);
            eprintln!("  json: {}", config.json);
            eprintln!("  backup: {}", config.backup);
            eprintln!("  backup_ext: {}", config.backup_ext);

            let start_dir = std::env::current_dir().unwrap_or_default();
            if let Some(path) = find_config_file(&start_dir) {
                eprintln!();
                eprintln!("Config file: {}", path.display());
            }

            Ok(())
        }

        ConfigAction::Path => {
            let start_dir = std::env::current_dir().unwrap_or_default();
            match find_config_file(&start_dir) {
                Some(path) => {
                    println!("{}", path.display());
                    Ok(())
                }
                None => Err(anyhow::anyhow!("No config file found")),
            }
        }
    }
}

fn validate_args(args: &Args) -> Result<()> {
    let (Some(template), Some(project)) = (&args.template, &args.project) else {
        return Err(ArgError("Both a TEMPLATE and a PROJECT file are required".to_string()).into());
    };

    if is_stdin(template) && is_stdin(project) {
        return Err(ArgError("Only one input can be read from stdin".to_string()).into());
    }

    if args.in_place && is_stdin(template) {
        return Err(ArgError("--in-place requires a template file, not stdin".to_string()).into());
    }

    if args.watch {
        if is_stdin(template) || is_stdin(project) {
            return Err(ArgError("--watch requires file inputs, not stdin".to_string()).into());
        }
        if let Some(output) = &args.output {
            if output == template || output == project {
                return Err(
                    ArgError("--watch output must differ from both inputs".to_string()).into(),
                );
            }
        }
    }

    Ok(())
}

/// Statistics collected during a merge
#[derive(Default, Clone)]
struct Stats {
    /// Number of entries in the template
    template_entries: usize,
    /// Number of entries in the project file
    project_entries: usize,
    /// Project entries dropped because the template already had them
    duplicates_dropped: usize,
    /// Number of entries added to the output
    new_entries: usize,
    /// Merge elapsed time
    elapsed: Duration,
}

impl Stats {
    fn collect(template: &str, project: &str, result: &MergeResult, elapsed: Duration) -> Self {
        let project_entries = entry_lines(project).count();
        Self {
            template_entries: entry_lines(template).count(),
            project_entries,
            duplicates_dropped: project_entries.saturating_sub(result.new_entries.len()),
            new_entries: result.new_entries.len(),
            elapsed,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Output Structures
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput<'a> {
    version: &'static str,
    status: &'static str,
    template: String,
    project: String,
    policy: MatchPolicy,
    placement: Placement,
    new_entries: &'a [String],
    input: InputStats,
    output: OutputStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
}

#[derive(Serialize)]
struct InputStats {
    template_lines: usize,
    project_lines: usize,
    template_entries: usize,
    project_entries: usize,
}

#[derive(Serialize)]
struct OutputStats {
    lines: usize,
    bytes: usize,
    duplicates_dropped: usize,
    changed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Line Classification
// ─────────────────────────────────────────────────────────────────────────────

/// Heading that introduces the block of entries added from the project
const DEFAULT_HEADING: &str = "# Project-specific entries";

/// Classification of a single ignore-file line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    /// Empty or whitespace-only
    Blank,
    /// Starts with `#` once leading whitespace is removed
    Comment,
    /// Anything else: one ignore pattern
    Entry,
}

/// Classify a single line
fn classify_line(line: &str) -> LineKind {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        LineKind::Blank
    } else if trimmed.starts_with('#') {
        LineKind::Comment
    } else {
        LineKind::Entry
    }
}

/// Entry lines of a document, in order and untrimmed
fn entry_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .filter(|line| classify_line(line) == LineKind::Entry)
}

/// Entry text with everything but ASCII letters, digits, `_` and `-` removed,
/// lower-cased.
fn loose_key(entry: &str) -> String {
    entry
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A section heading is a comment with a single leading `#`
fn is_section_heading(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('#') && !trimmed.starts_with("##")
}

// ─────────────────────────────────────────────────────────────────────────────
// Merge
// ─────────────────────────────────────────────────────────────────────────────

/// Knobs controlling a single merge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeOptions {
    policy: MatchPolicy,
    placement: Placement,
    heading: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            policy: MatchPolicy::default(),
            placement: Placement::default(),
            heading: DEFAULT_HEADING.to_string(),
        }
    }
}

/// Outcome of merging a project file into a template.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergeResult {
    /// The merged document
    content: String,
    /// Trimmed project entries that were added, in project order
    new_entries: Vec<String>,
}

impl MergeResult {
    fn is_new_entry(&self, line: &str) -> bool {
        self.new_entries.iter().any(|entry| entry == line)
    }
}

/// Merge `project` into `template`.
///
/// The template text is always kept verbatim. A project entry is new when its
/// policy key differs from the key of every template entry. Repeats within
/// the project are kept. Never fails: any pair of strings, including empty
/// ones, produces a result.
///
/// With [`Placement::Append`] the output is the template, two blank lines,
/// the heading, a blank line, then the project's lines minus the dropped
/// duplicates. Project comments and blank lines are carried over as they are,
/// even when they sat next to a dropped entry.
fn merge(template: &str, project: &str, options: &MergeOptions) -> MergeResult {
    let template_keys: HashSet<String> = entry_lines(template)
        .map(|entry| options.policy.key(entry))
        .collect();

    let mut new_entries = Vec::new();
    let mut kept_lines = Vec::new();

    for line in project.split('\n') {
        match classify_line(line) {
            LineKind::Blank | LineKind::Comment => kept_lines.push(line),
            LineKind::Entry => {
                let key = options.policy.key(line);
                if template_keys.contains(&key) {
                    continue;
                }
                kept_lines.push(line);
                new_entries.push(line.trim().to_string());
            }
        }
    }

    if new_entries.is_empty() {
        return MergeResult {
            content: template.to_string(),
            new_entries,
        };
    }

    let content = match options.placement {
        Placement::Append => append_section(template, &options.heading, &kept_lines),
        Placement::Section => place_in_sections(template, &options.heading, &new_entries),
    };

    MergeResult {
        content,
        new_entries,
    }
}

fn append_section(template: &str, heading: &str, lines: &[&str]) -> String {
    format!("{}\n\n{}\n\n{}", template, heading, lines.join("\n"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Section Placement
// ─────────────────────────────────────────────────────────────────────────────

/// A theme tying entries to template headings.
///
/// An entry belongs to the category when its loose key contains one of the
/// `patterns`; a heading belongs when its lower-cased text contains one of
/// the `keywords`.
struct Category {
    keywords: &'static [&'static str],
    patterns: &'static [&'static str],
}

const CATEGORIES: &[Category] = &[
    Category {
        keywords: &["node", "npm", "yarn", "pnpm"],
        patterns: &["node_modules", "package-lock", "yarn.lock", "pnpm-lock"],
    },
    Category {
        keywords: &["log", "debug"],
        patterns: &["log", "debug"],
    },
    Category {
        keywords: &["dist", "build", "output"],
        patterns: &["dist", "build", "out", "target"],
    },
    Category {
        keywords: &["env", "environment"],
        patterns: &[".env", "environment"],
    },
    Category {
        keywords: &["cache", "temp", "tmp"],
        patterns: &["cache", "temp", "tmp"],
    },
    Category {
        keywords: &["test", "coverage"],
        patterns: &["test", "coverage", "nyc"],
    },
    Category {
        keywords: &["ide", "editor"],
        patterns: &[".vscode", ".idea", ".sublime"],
    },
];

impl Category {
    fn matches_entry(&self, entry_key: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| entry_key.contains(&loose_key(pattern)))
    }

    fn matches_heading(&self, heading: &str) -> bool {
        self.keywords.iter().any(|keyword| heading.contains(keyword))
    }
}

/// Index of the last line of the first template section whose heading shares
/// a category with `entry`.
fn find_best_section(entry: &str, lines: &[&str]) -> Option<usize> {
    let entry_key = loose_key(entry);
    let categories: Vec<&Category> = CATEGORIES
        .iter()
        .filter(|category| category.matches_entry(&entry_key))
        .collect();
    if categories.is_empty() {
        return None;
    }

    for (i, line) in lines.iter().enumerate() {
        if !is_section_heading(line) {
            continue;
        }
        let heading = line.trim().to_lowercase();
        if !categories.iter().any(|c| c.matches_heading(&heading)) {
            continue;
        }
        let next_heading = lines[i + 1..]
            .iter()
            .position(|l| is_section_heading(l))
            .map_or(lines.len(), |offset| i + 1 + offset);
        return Some(next_heading - 1);
    }

    None
}

/// Insert `entries` under their related template sections.
///
/// Each group lands right after the last non-blank line of its section. A
/// blank separator is added when the group would otherwise run straight into
/// the next heading. Entries with no related section go into a trailing
/// `heading` block. Project comments are not carried in this mode.
fn place_in_sections(template: &str, heading: &str, entries: &[String]) -> String {
    let template_lines: Vec<&str> = template.split('\n').collect();

    let mut insertions: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
    let mut unplaced = Vec::new();
    for entry in entries {
        match find_best_section(entry, &template_lines) {
            Some(section_end) => insertions
                .entry(section_end)
                .or_default()
                .push(entry.as_str()),
            None => unplaced.push(entry.as_str()),
        }
    }

    let mut merged = template_lines.clone();

    // Bottom-up so earlier section indices stay valid
    for (&section_end, group) in insertions.iter().rev() {
        let mut insert_at = section_end + 1;
        while insert_at > 0 && merged[insert_at - 1].trim().is_empty() {
            insert_at -= 1;
        }

        let next_is_heading = merged[insert_at..]
            .iter()
            .find(|line| !line.trim().is_empty())
            .is_some_and(|line| line.trim().starts_with('#'));

        merged.splice(insert_at..insert_at, group.iter().copied());

        let after = insert_at + group.len();
        if next_is_heading && merged.get(after).is_some_and(|line| !line.trim().is_empty()) {
            merged.insert(after, "");
        }
    }

    if !unplaced.is_empty() {
        merged.push("");
        merged.push(heading);
        merged.extend(unplaced);
    }

    merged.join("\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Input Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Reject empty inputs before merging. Whitespace-only counts as empty.
fn validate_inputs(template: &str, project: &str) -> Result<(), ValidationError> {
    match (template.trim().is_empty(), project.trim().is_empty()) {
        (true, true) => Err(ValidationError::BothEmpty),
        (true, false) => Err(ValidationError::TemplateEmpty),
        (false, true) => Err(ValidationError::ProjectEmpty),
        (false, false) => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input / Output
// ─────────────────────────────────────────────────────────────────────────────

/// Path argument meaning "read from stdin"
const STDIN_ARG: &str = "-";

fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == STDIN_ARG
}

fn input_label(path: &Path) -> String {
    if is_stdin(path) {
        "stdin".to_string()
    } else {
        path.display().to_string()
    }
}

/// Creates a backup of the file by appending the extension to the filename.
/// For example: ".gitignore" with extension ".bak" becomes ".gitignore.bak"
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read an input argument, either a file path or "-" for stdin
fn read_input(path: &Path) -> Result<String> {
    if is_stdin(path) {
        read_stdin_content()
    } else {
        read_file(path)
    }
}

/// Read content from a file path
fn read_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    parse_bytes_to_text(bytes, &path.display().to_string())
}

/// Read content from stdin
fn read_stdin_content() -> Result<String> {
    let mut buf = Vec::new();
    io::stdin()
        .read_to_end(&mut buf)
        .context("Failed to read stdin")?;
    parse_bytes_to_text(buf, "stdin")
}

/// Convert raw bytes to text, checking for binary content and valid UTF-8
fn parse_bytes_to_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

/// Text as written to disk or stdout: non-empty output ends with a newline
fn with_trailing_newline(content: &str) -> String {
    let mut output = content.to_string();
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output
}

fn write_output_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, with_trailing_newline(content))
        .with_context(|| format!("Failed to write to file: {}", path.display()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

/// A completed merge together with what produced it
struct MergeRun {
    template_label: String,
    project_label: String,
    template: String,
    project: String,
    result: MergeResult,
    stats: Stats,
}

impl MergeRun {
    fn would_change(&self) -> bool {
        !self.result.new_entries.is_empty()
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Config { action }) = &args.command {
        let exit_code = match run_config_command(action) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

/// Read both inputs, validate them and merge
fn load_and_merge(
    template_path: &Path,
    project_path: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<MergeRun> {
    let template = read_input(template_path)?;
    let project = read_input(project_path)?;
    let template_label = input_label(template_path);
    let project_label = input_label(project_path);

    validate_inputs(&template, &project)?;

    if config.verbose {
        console.print(&styles.bold(format!(
            "Merging {} into {} ({:?} match, {:?} placement)...",
            escape_markup(&project_label),
            escape_markup(&template_label),
            config.policy,
            config.placement
        )));
    }

    let start = Instant::now();
    let result = merge(&template, &project, &config.merge_options());
    let stats = Stats::collect(&template, &project, &result, start.elapsed());

    Ok(MergeRun {
        template_label,
        project_label,
        template,
        project,
        result,
        stats,
    })
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    let (Some(template_path), Some(project_path)) = (&args.template, &args.project) else {
        return Err(ArgError("Both a TEMPLATE and a PROJECT file are required".to_string()).into());
    };

    if config.watch {
        let output = args
            .output
            .as_deref()
            .ok_or_else(|| ArgError("--watch requires --output".to_string()))?;
        return watch_and_merge(template_path, project_path, output, &config, &console, &styles);
    }

    let run = load_and_merge(template_path, project_path, &config, &console, &styles)?;
    output_result(&args, &config, &console, &styles, &run).context("Error merging files")?;

    if config.verbose {
        print_stats_summary(&run.stats, &console, &styles);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change: run.would_change(),
    })
}

/// Emit a merge in the mode selected by the configuration
fn output_result(
    args: &Args,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    run: &MergeRun,
) -> Result<()> {
    if config.json {
        return output_json(args, config, run);
    }
    if config.dry_run {
        return output_dry_run(config, console, styles, run);
    }
    if config.diff {
        return output_diff(run);
    }
    if config.highlight {
        output_highlight(console, styles, run);
        return Ok(());
    }
    write_destination(args, config, console, styles, run)
}

/// Write the merged content to the template (in-place), the output file, or stdout
fn write_destination(
    args: &Args,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    run: &MergeRun,
) -> Result<()> {
    if args.in_place {
        let path = args
            .template
            .as_deref()
            .ok_or_else(|| ArgError("--in-place requires a template file".to_string()))?;

        if !run.would_change() {
            if config.verbose {
                console.print(&styles.dim(format!(
                    "{}: nothing to add",
                    escape_markup(&run.template_label)
                )));
            }
            return Ok(());
        }

        if config.backup {
            let backup_path = create_backup(path, &config.backup_ext)?;
            if config.verbose {
                console.print(&styles.dim(format!(
                    "Created backup: {}",
                    escape_markup(&backup_path.display().to_string())
                )));
            }
        }

        return write_output_file(path, &run.result.content);
    }

    if let Some(path) = &args.output {
        write_output_file(path, &run.result.content)?;
        if config.verbose {
            console.print(&styles.dim(format!(
                "Wrote {}",
                escape_markup(&path.display().to_string())
            )));
        }
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    write!(stdout, "{}", with_trailing_newline(&run.result.content))?;
    Ok(())
}

/// Output a unified diff of the template against the merged result
fn output_diff(run: &MergeRun) -> Result<()> {
    if !run.would_change() {
        return Ok(());
    }

    let diff = TextDiff::from_lines(&run.template, &run.result.content);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", run.template_label)?;
    writeln!(stdout, "+++ b/{} (merged)", run.template_label)?;

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

/// List the entries a merge would add, without writing anything
fn output_dry_run(
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    run: &MergeRun,
) -> Result<()> {
    if config.diff {
        output_diff(run)?;
    } else {
        let mut stdout = io::stdout().lock();
        for entry in &run.result.new_entries {
            writeln!(stdout, "{}", entry)?;
        }
    }

    if config.verbose {
        if run.would_change() {
            console.print(&styles.added(format!(
                "Would add {} entr{} to {}",
                run.result.new_entries.len(),
                if run.result.new_entries.len() == 1 { "y" } else { "ies" },
                escape_markup(&run.template_label)
            )));
        } else {
            console.print(&styles.added(format!(
                "Nothing to add: {} already covers {}",
                escape_markup(&run.template_label),
                escape_markup(&run.project_label)
            )));
        }
    }

    Ok(())
}

/// Render the merged result line by line, marking lines that are new entries
fn output_highlight(console: &Console, styles: &VerboseStyle, run: &MergeRun) {
    let count = run.result.new_entries.len();
    console.print(&styles.header(format!(
        "Merged {} ({} new entr{})",
        escape_markup(&run.template_label),
        count,
        if count == 1 { "y" } else { "ies" }
    )));

    for line in run.result.content.lines() {
        if run.result.is_new_entry(line) {
            console.print(&styles.added(format!("+ {}", escape_markup(line))));
        } else {
            console.print(&format!("  {}", escape_markup(line)));
        }
    }
}

fn build_json_output<'a>(args: &Args, config: &Config, run: &'a MergeRun) -> JsonOutput<'a> {
    let writes_file = args.in_place || args.output.is_some();
    let content = &run.result.content;

    JsonOutput {
        version: "1.0",
        status: if config.dry_run { "dry_run" } else { "success" },
        template: run.template_label.clone(),
        project: run.project_label.clone(),
        policy: config.policy,
        placement: config.placement,
        new_entries: &run.result.new_entries,
        input: InputStats {
            template_lines: run.template.lines().count(),
            project_lines: run.project.lines().count(),
            template_entries: run.stats.template_entries,
            project_entries: run.stats.project_entries,
        },
        output: OutputStats {
            lines: content.lines().count(),
            bytes: content.len(),
            duplicates_dropped: run.stats.duplicates_dropped,
            changed: run.would_change(),
        },
        content: if config.dry_run || writes_file {
            None
        } else {
            Some(content)
        },
    }
}

/// Output JSON for a merge, still writing the file when a destination was given
fn output_json(args: &Args, config: &Config, run: &MergeRun) -> Result<()> {
    let json_output = build_json_output(args, config, run);

    println!(
        "{}",
        serde_json::to_string_pretty(&json_output).context("Failed to serialize JSON output")?
    );

    if config.dry_run {
        return Ok(());
    }

    if args.in_place && run.would_change() {
        if let Some(path) = args.template.as_deref() {
            if config.backup {
                create_backup(path, &config.backup_ext)?;
            }
            write_output_file(path, &run.result.content)?;
        }
    } else if let Some(path) = &args.output {
        write_output_file(path, &run.result.content)?;
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Re-merge into `output` once now, then whenever either input changes
fn watch_and_merge(
    template_path: &Path,
    project_path: &Path,
    output: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    for path in [template_path, project_path] {
        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }
        if !path.is_file() {
            anyhow::bail!(
                "--watch requires a file, not a directory: {}",
                path.display()
            );
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;

    for path in [template_path, project_path] {
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch file: {}", path.display()))?;
    }

    let debounce = Duration::from_millis(config.debounce_ms);

    eprintln!(
        "Watching {} and {} for changes (Ctrl+C to stop)...",
        template_path.display(),
        project_path.display()
    );

    let mut any_changes = remerge(template_path, project_path, output, config, console, styles);
    // Set by each change event; the merge runs once the inputs stay quiet
    let mut pending_since: Option<Instant> = None;

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    pending_since = Some(Instant::now());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        if pending_since.is_some_and(|since| since.elapsed() >= debounce) {
            pending_since = None;
            any_changes |= remerge(template_path, project_path, output, config, console, styles);
        }
    }

    eprintln!("\nWatch mode stopped.");

    Ok(RunOutcome {
        dry_run: false,
        would_change: any_changes,
    })
}

/// One watch-mode merge; failures are reported and the watch keeps going
fn remerge(
    template_path: &Path,
    project_path: &Path,
    output: &Path,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) -> bool {
    let run = match load_and_merge(template_path, project_path, config, console, styles) {
        Ok(run) => run,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            return false;
        }
    };

    if let Err(e) = write_output_file(output, &run.result.content) {
        eprintln!("✗ Error merging files: {:#}", e);
        return false;
    }

    eprintln!(
        "✓ Wrote {} ({} new entr{})",
        output.display(),
        run.stats.new_entries,
        if run.stats.new_entries == 1 { "y" } else { "ies" }
    );
    run.would_change()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
