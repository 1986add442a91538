//! Parsing and migration-time reconciliation of QEMU command lines.
//!
//! A destination host renders its own command line with host-local ports and sockets.
//! [`unify`] converges it onto the source host's command line: the static options come
//! from the source through a character-level text patch, while the dynamic options
//! (incoming address, display sockets, daemonize flag, monitor chardevs) always come
//! from the current host.

use std::{
    borrow::Cow,
    fmt::{self, Display},
};

use similar::{DiffOp, TextDiff};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CmdlineError {
    #[error("empty command line")]
    Empty,

    #[error("unterminated quote in command line")]
    UnterminatedQuote,

    #[error("expected an option, found '{0}'")]
    UnexpectedValue(String),

    #[error("patch hunk at {offset} does not apply: expected '{expected}'")]
    PatchMismatch { offset: usize, expected: String },
}

/// Chardev ids of the monitor sockets, which name host-local ports.
const MONITOR_CHARDEV_PREFIXES: [&str; 4] = [
    "socket,id=hmqmondev",
    "socket,id=hmpmondev",
    "socket,id=qmqmondev",
    "socket,id=qmpmondev",
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CmdlineOption {
    pub key: String,
    pub value: Option<String>,
}

impl CmdlineOption {
    pub fn new(key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            value: value.map(Into::into),
        }
    }

    /// True for options naming host-local resources.
    pub fn is_dynamic(&self) -> bool {
        let value = self.value.as_deref().unwrap_or("");
        match self.key.as_str() {
            "incoming" => value.starts_with("tcp:") || value.starts_with("defer"),
            "vnc" | "spice" | "daemonize" => true,
            "chardev" => MONITOR_CHARDEV_PREFIXES
                .iter()
                .any(|prefix| value.starts_with(prefix)),
            _ => false,
        }
    }
}

impl Display for CmdlineOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}", self.key)?;
        if let Some(value) = &self.value {
            write!(f, " {}", quote(value))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmdline {
    program: String,
    options: Vec<CmdlineOption>,
}

impl Cmdline {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            options: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn options(&self) -> &[CmdlineOption] {
        &self.options
    }

    pub fn add_option(&mut self, option: CmdlineOption) -> &mut Self {
        self.options.push(option);
        self
    }

    /// Appends options, dropping identical ones already present.
    pub fn add_options(&mut self, options: impl IntoIterator<Item = CmdlineOption>) -> &mut Self {
        for option in options {
            self.options.retain(|existing| existing != &option);
            self.options.push(option);
        }
        self
    }

    /// Order-independent comparison of the option sets.
    pub fn same_options(&self, other: &Cmdline) -> bool {
        let mut ours = self.options.clone();
        let mut theirs = other.options.clone();
        ours.sort();
        theirs.sort();
        ours == theirs
    }

    /// Arguments suitable for `Command::args`, without the program.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.options.len() * 2);
        for option in &self.options {
            args.push(format!("-{}", option.key));
            if let Some(value) = &option.value {
                args.push(value.clone());
            }
        }
        args
    }

    fn options_text(&self) -> String {
        self.options
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Display for Cmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&quote(&self.program))?;
        for option in &self.options {
            write!(f, " {option}")?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    if value.is_empty() || value.contains(char::is_whitespace) || value.contains(['\'', '"', '\\'])
    {
        shell_escape::escape(value.into())
    } else {
        value.into()
    }
}

/// Splits text into words the way a POSIX shell does for quoting and escapes.
pub fn split_words(text: &str) -> Result<Vec<String>, CmdlineError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(CmdlineError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(CmdlineError::UnterminatedQuote),
                        },
                        Some(c) => word.push(c),
                        None => return Err(CmdlineError::UnterminatedQuote),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Parses a command line, returning the static options and, separately, the dynamic ones.
pub fn parse(text: &str) -> Result<(Cmdline, Vec<CmdlineOption>), CmdlineError> {
    let words = split_words(text)?;
    let mut words = words.into_iter().peekable();
    let program = match words.next() {
        Some(program) if !program.starts_with('-') => program,
        Some(word) => return Err(CmdlineError::UnexpectedValue(word)),
        None => return Err(CmdlineError::Empty),
    };

    let mut cmdline = Cmdline::new(program);
    let mut dynamic = Vec::new();
    while let Some(word) = words.next() {
        if !word.starts_with('-') {
            return Err(CmdlineError::UnexpectedValue(word));
        }
        let key = word.trim_start_matches('-').to_owned();
        let value = words.next_if(|next| !next.starts_with('-'));
        let option = CmdlineOption { key, value };
        if option.is_dynamic() {
            dynamic.push(option);
        } else {
            cmdline.options.push(option);
        }
    }
    Ok((cmdline, dynamic))
}

/// One contiguous edit, positioned in characters of the text it was made from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk {
    offset: usize,
    old: String,
    new: String,
}

/// Character-level patch from one text to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    hunks: Vec<Hunk>,
}

impl Patch {
    pub fn make(old: &str, new: &str) -> Self {
        let diff = TextDiff::from_chars(old, new);
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();
        let slice = |chars: &[char], start: usize, len: usize| -> String {
            chars[start..start + len].iter().collect()
        };

        let hunks = diff
            .ops()
            .iter()
            .filter_map(|op| match *op {
                DiffOp::Equal { .. } => None,
                DiffOp::Delete {
                    old_index, old_len, ..
                } => Some(Hunk {
                    offset: old_index,
                    old: slice(&old_chars, old_index, old_len),
                    new: String::new(),
                }),
                DiffOp::Insert {
                    old_index,
                    new_index,
                    new_len,
                } => Some(Hunk {
                    offset: old_index,
                    old: String::new(),
                    new: slice(&new_chars, new_index, new_len),
                }),
                DiffOp::Replace {
                    old_index,
                    old_len,
                    new_index,
                    new_len,
                } => Some(Hunk {
                    offset: old_index,
                    old: slice(&old_chars, old_index, old_len),
                    new: slice(&new_chars, new_index, new_len),
                }),
            })
            .collect();
        Self { hunks }
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Applies hunks back to front so earlier offsets stay valid.
    pub fn apply(&self, text: &str) -> Result<String, CmdlineError> {
        let mut chars: Vec<char> = text.chars().collect();
        for hunk in self.hunks.iter().rev() {
            let old: Vec<char> = hunk.old.chars().collect();
            let end = hunk.offset + old.len();
            if end > chars.len() || chars[hunk.offset..end] != old[..] {
                return Err(CmdlineError::PatchMismatch {
                    offset: hunk.offset,
                    expected: hunk.old.clone(),
                });
            }
            chars.splice(hunk.offset..end, hunk.new.chars());
        }
        Ok(chars.into_iter().collect())
    }
}

/// Reconciles the current host's command line with the migration source's.
pub fn unify(current: &str, source: &str) -> Result<String, CmdlineError> {
    let (current, current_dynamic) = parse(current)?;
    let (source, _) = parse(source)?;

    let current_text = current.options_text();
    let patch = Patch::make(&current_text, &source.options_text());
    debug!(hunks = patch.hunks.len(), "cmdline patch");
    let patched = patch.apply(&current_text)?;

    let (mut unified, _) = parse(&format!("{} {patched}", quote(current.program())))?;
    unified.add_options(current_dynamic);
    Ok(unified.to_string())
}
