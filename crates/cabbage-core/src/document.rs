//! Orchestra documents.
//!
//! An [`OrchestraDocument`] is the text of a `.csd` file plus the metadata
//! the core derives from it: the `<Cabbage>` widget declarations (and the
//! channels they bind), the global header of `<CsInstruments>`, widget
//! macros and explicit channel declarations.
//!
//! Parsing never fails. A document without metadata simply yields empty
//! lists and `None` header values; whether the text is a valid orchestra
//! is for the engine to decide at compile time.

use std::fmt;

/// Channel count assumed when the orchestra does not set `nchnls`.
pub const DEFAULT_CHANNEL_COUNT: u32 = 2;

/// A parsed `.csd` document. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestraDocument {
    text: String,
    header: OrchestraHeader,
    widgets: Vec<WidgetDeclaration>,
    macros: Vec<(String, String)>,
    declared_channels: Vec<ChannelDeclaration>,
}

/// Global assignments found at the top of `<CsInstruments>`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrchestraHeader {
    pub sample_rate: Option<f64>,
    pub ksmps: Option<u32>,
    pub nchnls: Option<u32>,
    pub nchnls_i: Option<u32>,
    pub zero_dbfs: Option<f64>,
}

/// Data direction of a channel, seen from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelDirection {
    /// Written by the GUI, read by the engine.
    Input,
    /// Written by the engine, read by the GUI.
    Output,
    /// Both.
    Bidirectional,
}

impl ChannelDirection {
    /// Whether the GUI may stage values into this channel.
    pub fn accepts_input(self) -> bool {
        matches!(self, ChannelDirection::Input | ChannelDirection::Bidirectional)
    }

    /// Combine two declarations of the same channel.
    pub fn merge(self, other: ChannelDirection) -> ChannelDirection {
        if self == other {
            self
        } else {
            ChannelDirection::Bidirectional
        }
    }
}

/// Rate of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRate {
    /// One scalar per k-cycle.
    Control,
    /// One sample per frame of a k-cycle.
    Audio,
}

/// A channel named explicitly by the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDeclaration {
    pub name: String,
    pub rate: ChannelRate,
    pub direction: ChannelDirection,
    pub default_value: f64,
}

/// A single attribute argument of a widget declaration.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl AttributeValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Number(_) => None,
        }
    }
}

/// One line of the `<Cabbage>` section, e.g.
/// `rslider bounds(10, 10, 60, 60), channel("gain"), range(0, 1, 0.5)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetDeclaration {
    pub kind: String,
    pub attributes: Vec<(String, Vec<AttributeValue>)>,
}

impl WidgetDeclaration {
    /// Arguments of the first attribute with this identifier.
    pub fn attribute(&self, name: &str) -> Option<&[AttributeValue]> {
        self.attributes
            .iter()
            .find(|(ident, _)| ident == name)
            .map(|(_, args)| args.as_slice())
    }

    /// First argument of an attribute, as text.
    pub fn text_attribute(&self, name: &str) -> Option<&str> {
        self.attribute(name)?.first()?.as_text()
    }

    /// Channels bound by this widget (`channel("a")`, or `channel("x", "y")` for pads).
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.attribute("channel")
            .unwrap_or(&[])
            .iter()
            .filter_map(AttributeValue::as_text)
    }

    /// Initial value: `value(v)`, else the third argument of `range(min, max, v)`, else 0.
    pub fn default_value(&self) -> f64 {
        if let Some(v) = self
            .attribute("value")
            .and_then(|args| args.first())
            .and_then(AttributeValue::as_number)
        {
            return v;
        }
        self.attribute("range")
            .and_then(|args| args.get(2))
            .and_then(AttributeValue::as_number)
            .unwrap_or(0.0)
    }
}

impl OrchestraDocument {
    /// Parse a document from its text.
    pub fn parse(text: impl Into<String>) -> Self {
        let text = text.into();
        let cabbage = section(&text, "Cabbage").unwrap_or("");
        let orchestra = section(&text, "CsInstruments").unwrap_or("");

        let mut widgets = Vec::new();
        let mut macros = Vec::new();
        for line in cabbage.lines() {
            let line = strip_comment(line).trim();
            if let Some(rest) = line.strip_prefix("#define") {
                if let Some(m) = parse_macro(rest) {
                    macros.push(m);
                }
            } else if let Some(widget) = parse_widget(line) {
                widgets.push(widget);
            }
        }

        Self {
            header: parse_header(orchestra),
            declared_channels: parse_channel_declarations(orchestra),
            widgets,
            macros,
            text,
        }
    }

    /// The full document text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether the document contains an orchestra section.
    pub fn has_orchestra(&self) -> bool {
        section(&self.text, "CsInstruments").is_some()
    }

    /// Text of `<CsOptions>`, if present.
    pub fn options(&self) -> Option<&str> {
        section(&self.text, "CsOptions").map(str::trim)
    }

    pub fn header(&self) -> &OrchestraHeader {
        &self.header
    }

    pub fn widgets(&self) -> &[WidgetDeclaration] {
        &self.widgets
    }

    /// `#define` macros from the `<Cabbage>` section as `(name, value)` pairs.
    pub fn macros(&self) -> &[(String, String)] {
        &self.macros
    }

    /// Engine options that define the widget macros (`--omacro:NAME=value`).
    pub fn macro_options(&self) -> impl Iterator<Item = String> + '_ {
        self.macros
            .iter()
            .map(|(name, value)| format!("--omacro:{}={}", name, value))
    }

    /// Output channel count the orchestra expects.
    pub fn intended_channel_count(&self) -> u32 {
        self.header.nchnls.unwrap_or(DEFAULT_CHANNEL_COUNT)
    }

    /// Input channel count the orchestra expects (`nchnls_i`, else `nchnls`).
    pub fn intended_input_count(&self) -> u32 {
        self.header
            .nchnls_i
            .unwrap_or_else(|| self.intended_channel_count())
    }

    /// The `pluginid` of the first `form` declaration.
    pub fn plugin_id(&self) -> Option<&str> {
        self.widgets
            .iter()
            .find(|w| w.kind == "form")
            .and_then(|w| w.text_attribute("pluginid"))
    }

    /// Every channel named by the document, widget channels first.
    ///
    /// Names are unique; a channel declared twice keeps its first default
    /// and merges directions.
    pub fn channel_declarations(&self) -> Vec<ChannelDeclaration> {
        let mut out: Vec<ChannelDeclaration> = Vec::new();
        let widget_channels = self.widgets.iter().flat_map(|w| {
            let default_value = w.default_value();
            w.channels().map(move |name| ChannelDeclaration {
                name: name.to_string(),
                rate: ChannelRate::Control,
                direction: ChannelDirection::Bidirectional,
                default_value,
            })
        });
        for decl in widget_channels.chain(self.declared_channels.iter().cloned()) {
            match out.iter_mut().find(|d| d.name == decl.name) {
                Some(existing) => existing.direction = existing.direction.merge(decl.direction),
                None => out.push(decl),
            }
        }
        out
    }

    /// The statement that creates function table `number`, for display.
    ///
    /// Looks for `ftgen` opcodes in the orchestra and `f` statements in the score.
    pub fn table_statement(&self, number: i32) -> Option<&str> {
        let wanted = number as f64;
        let orchestra = section(&self.text, "CsInstruments").unwrap_or("");
        for line in orchestra.lines() {
            let code = strip_comment(line).trim();
            if let Some(pos) = find_word(code, "ftgen") {
                let first = code[pos + "ftgen".len()..].split(',').next().unwrap_or("");
                if first.trim().parse::<f64>().ok() == Some(wanted) {
                    return Some(code);
                }
            }
        }
        let score = section(&self.text, "CsScore").unwrap_or("");
        for line in score.lines() {
            let code = strip_comment(line).trim();
            if let Some(rest) = code.strip_prefix('f') {
                let first = rest.split_whitespace().next().unwrap_or("");
                if first.parse::<f64>().ok() == Some(wanted) {
                    return Some(code);
                }
            }
        }
        None
    }
}

impl fmt::Display for OrchestraDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Text between `<tag>` and `</tag>`.
fn section<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

/// Drop a trailing `;` or `//` comment, ignoring markers inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let bytes = line.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quotes = !in_quotes,
            b';' if !in_quotes => return &line[..i],
            b'/' if !in_quotes && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Position of `word` as a whole identifier inside `code`.
fn find_word(code: &str, word: &str) -> Option<usize> {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut from = 0;
    while let Some(found) = code[from..].find(word) {
        let pos = from + found;
        let before = code[..pos].chars().next_back();
        let after = code[pos + word.len()..].chars().next();
        if !before.is_some_and(is_ident) && !after.is_some_and(is_ident) {
            return Some(pos);
        }
        from = pos + word.len();
    }
    None
}

fn parse_macro(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim();
    let split = rest.find(char::is_whitespace)?;
    let name = &rest[..split];
    let value: String = rest[split..]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if name.is_empty() || value.is_empty() {
        return None;
    }
    Some((name.to_string(), value.replace('"', "\\\"")))
}

fn parse_header(orchestra: &str) -> OrchestraHeader {
    let mut header = OrchestraHeader::default();
    for line in orchestra.lines() {
        let code = strip_comment(line).trim();
        if code.starts_with("instr") || code.starts_with("opcode") {
            break;
        }
        let Some((name, value)) = code.split_once('=') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<f64>() else {
            continue;
        };
        match name.trim() {
            "sr" => header.sample_rate = Some(value),
            "ksmps" => header.ksmps = Some(value as u32),
            "nchnls" => header.nchnls = Some(value as u32),
            "nchnls_i" => header.nchnls_i = Some(value as u32),
            "0dbfs" => header.zero_dbfs = Some(value),
            _ => {}
        }
    }
    header
}

/// `chn_k "name", mode` and `chn_a "name", mode` declarations.
fn parse_channel_declarations(orchestra: &str) -> Vec<ChannelDeclaration> {
    let mut out = Vec::new();
    for line in orchestra.lines() {
        let code = strip_comment(line).trim();
        let (rate, rest) = if let Some(pos) = find_word(code, "chn_k") {
            (ChannelRate::Control, &code[pos + 5..])
        } else if let Some(pos) = find_word(code, "chn_a") {
            (ChannelRate::Audio, &code[pos + 5..])
        } else {
            continue;
        };
        let args = split_args(rest);
        let Some(AttributeValue::Text(name)) = args.first() else {
            continue;
        };
        let direction = match args.get(1).and_then(AttributeValue::as_number) {
            Some(m) if m as i32 == 1 => ChannelDirection::Input,
            Some(m) if m as i32 == 2 => ChannelDirection::Output,
            _ => ChannelDirection::Bidirectional,
        };
        let default_value = args
            .get(3)
            .and_then(AttributeValue::as_number)
            .unwrap_or(0.0);
        out.push(ChannelDeclaration {
            name: name.clone(),
            rate,
            direction,
            default_value,
        });
    }
    out
}

fn parse_widget(line: &str) -> Option<WidgetDeclaration> {
    let kind_len = line
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(line.len());
    if kind_len == 0 || !line[kind_len..].starts_with(char::is_whitespace) {
        return None;
    }
    let kind = &line[..kind_len];
    let mut attributes = Vec::new();
    let mut rest = line[kind_len..].trim_start();

    while !rest.is_empty() {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        let ident_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if ident_len == 0 {
            break;
        }
        let ident = &rest[..ident_len];
        let after = rest[ident_len..].trim_start();
        let Some(body) = after.strip_prefix('(') else {
            break;
        };
        let close = matching_paren(body)?;
        attributes.push((ident.to_string(), split_args(&body[..close])));
        rest = &body[close + 1..];
    }

    if attributes.is_empty() {
        return None;
    }
    Some(WidgetDeclaration {
        kind: kind.to_string(),
        attributes,
    })
}

/// Index of the `)` closing an already-opened parenthesis.
fn matching_paren(body: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quotes = false;
    for (i, c) in body.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Split comma-separated arguments; quoted arguments become text.
fn split_args(args: &str) -> Vec<AttributeValue> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quoted = false;

    let mut flush = |current: &mut String, quoted: &mut bool| {
        let token = current.trim();
        if *quoted {
            out.push(AttributeValue::Text(current.clone()));
        } else if !token.is_empty() {
            match token.parse::<f64>() {
                Ok(n) => out.push(AttributeValue::Number(n)),
                Err(_) => out.push(AttributeValue::Text(token.to_string())),
            }
        }
        current.clear();
        *quoted = false;
    };

    for c in args.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                if in_quotes {
                    current.clear();
                    quoted = true;
                }
            }
            ',' if !in_quotes => flush(&mut current, &mut quoted),
            _ if in_quotes || !quoted => current.push(c),
            _ => {}
        }
    }
    flush(&mut current, &mut quoted);
    out
}
