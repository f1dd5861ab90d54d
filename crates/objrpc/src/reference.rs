//! Object references
//!
//! A [`Reference`] is the immutable description of how to reach a remote
//! object. Its textual form is
//!
//! ```text
//! identity {option} [':' endpoint {':' endpoint} {flag} | '@' adapterId {flag}]
//!
//! option := -f facet | -a adapterId | flag
//! flag   := -t timeoutMs | -s | -o | -O | -d | -D
//! ```
//!
//! Flags may also follow the last endpoint, as in
//! `test:tcp -p 12010 -t 500 -s -o`. An endpoint `-t` bounds connection
//! establishment and, unless a flag `-t` is given, is also the call
//! timeout.
//!
//! Tokens containing whitespace, `:`, `@` or `"` are double-quoted; inside
//! quotes a backslash escapes the next character.

use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};
use objrpc_wire::{Context, Identity, InvocationMode};
use std::fmt;
use std::time::Duration;

/// Values applied to references parsed without an explicit setting
#[derive(Debug, Clone)]
pub struct ReferenceDefaults {
    pub timeout: Option<Duration>,
    pub collocation_optimized: bool,
    pub context: Context,
}

impl Default for ReferenceDefaults {
    fn default() -> Self {
        Self {
            timeout: None,
            collocation_optimized: true,
            context: Context::new(),
        }
    }
}

/// Immutable description of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub identity: Identity,
    pub facet: String,
    /// Set for indirect references, resolved through the locator
    pub adapter_id: Option<String>,
    /// Set for direct references
    pub endpoints: Vec<Endpoint>,
    pub mode: InvocationMode,
    pub secure: bool,
    pub collocation_optimized: bool,
    /// Per-call timeout; `None` waits forever
    pub timeout: Option<Duration>,
    pub context: Context,
}

impl Reference {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            facet: String::new(),
            adapter_id: None,
            endpoints: Vec::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            collocation_optimized: true,
            timeout: None,
            context: Context::new(),
        }
    }

    /// Parse the textual form
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, &ReferenceDefaults::default())
    }

    /// Parse the textual form, filling unspecified settings from `defaults`
    pub fn parse_with(text: &str, defaults: &ReferenceDefaults) -> Result<Self> {
        let (head, tail) = split_reference(text);
        let tokens = tokenize(text, head)?;
        let mut tokens = tokens.into_iter();

        let ident_token = tokens
            .next()
            .ok_or_else(|| RpcError::malformed(text, "", "missing identity"))?;
        let identity = Identity::parse(&ident_token)
            .map_err(|e| RpcError::malformed(text, ident_token.clone(), e.reason))?;

        let mut reference = Reference::new(identity);
        reference.collocation_optimized = defaults.collocation_optimized;
        reference.context = defaults.context.clone();
        // Some(..) once a flag `-t` is seen, even `-t -1`
        let mut timeout = None;

        while let Some(option) = tokens.next() {
            match option.as_str() {
                "-f" => reference.facet = option_argument(text, &option, &mut tokens)?,
                "-a" => {
                    reference.adapter_id = Some(option_argument(text, &option, &mut tokens)?)
                }
                _ => apply_flag(text, &option, &mut tokens, &mut reference, &mut timeout)?,
            }
        }

        match tail {
            Some(('@', rest)) => {
                if reference.adapter_id.is_some() {
                    return Err(RpcError::malformed(text, "@", "adapter id given twice"));
                }
                let mut tokens = tokenize(text, rest)?.into_iter();
                let adapter_id = tokens
                    .next()
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| {
                        RpcError::malformed(text, rest.trim(), "expected one adapter id")
                    })?;
                reference.adapter_id = Some(adapter_id);
                while let Some(flag) = tokens.next() {
                    apply_flag(text, &flag, &mut tokens, &mut reference, &mut timeout)?;
                }
            }
            Some((_, rest)) => {
                if reference.adapter_id.is_some() {
                    return Err(RpcError::malformed(
                        text,
                        ":",
                        "adapter id and endpoints are exclusive",
                    ));
                }
                let parts = split_endpoints(rest);
                let last = parts.len() - 1;
                for (i, part) in parts.into_iter().enumerate() {
                    let (endpoint_text, flags) = if i == last {
                        split_trailing_flags(part)
                    } else {
                        (part.trim().to_string(), Vec::new())
                    };
                    let endpoint = Endpoint::parse(&endpoint_text).map_err(|_| {
                        RpcError::malformed(text, endpoint_text.clone(), "invalid endpoint")
                    })?;
                    reference.endpoints.push(endpoint);

                    let mut flags = flags.into_iter();
                    while let Some(flag) = flags.next() {
                        apply_flag(text, &flag, &mut flags, &mut reference, &mut timeout)?;
                    }
                }
            }
            None => {}
        }

        reference.timeout = match timeout {
            Some(explicit) => explicit,
            None => reference
                .endpoints
                .iter()
                .find_map(|endpoint| endpoint.timeout)
                .or(defaults.timeout),
        };

        Ok(reference)
    }

    pub fn is_indirect(&self) -> bool {
        self.adapter_id.is_some()
    }

    /// Neither endpoints nor an adapter id: only reachable collocated
    pub fn is_well_known(&self) -> bool {
        self.adapter_id.is_none() && self.endpoints.is_empty()
    }

    /// Same remote object: identity, facet and addressing agree
    pub fn same_object(&self, other: &Reference) -> bool {
        self.identity == other.identity
            && self.facet == other.facet
            && self.adapter_id == other.adapter_id
            && self.endpoints == other.endpoints
    }

    pub fn with_identity(&self, identity: Identity) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        Self {
            facet: facet.into(),
            ..self.clone()
        }
    }

    /// Switch to indirect addressing; endpoints are dropped
    pub fn with_adapter_id(&self, adapter_id: Option<String>) -> Self {
        let adapter_id = adapter_id.filter(|id| !id.is_empty());
        let endpoints = if adapter_id.is_some() {
            Vec::new()
        } else {
            self.endpoints.clone()
        };
        Self {
            adapter_id,
            endpoints,
            ..self.clone()
        }
    }

    /// Switch to direct addressing; the adapter id is dropped
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        let adapter_id = if endpoints.is_empty() {
            self.adapter_id.clone()
        } else {
            None
        };
        Self {
            adapter_id,
            endpoints,
            ..self.clone()
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        Self {
            mode,
            ..self.clone()
        }
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        Self {
            secure,
            ..self.clone()
        }
    }

    pub fn with_collocation_optimized(&self, collocation_optimized: bool) -> Self {
        Self {
            collocation_optimized,
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn with_context(&self, context: Context) -> Self {
        Self {
            context,
            ..self.clone()
        }
    }
}

/// Endpoints usable for `mode` and `secure`, in connection order.
///
/// Datagram modes keep only datagram endpoints, the other modes only
/// stream endpoints. A secure reference keeps only secure endpoints;
/// otherwise non-secure endpoints come first unless `prefer_secure`.
pub fn filter_endpoints(
    endpoints: &[Endpoint],
    mode: InvocationMode,
    secure: bool,
    prefer_secure: bool,
) -> Vec<Endpoint> {
    let mut usable: Vec<Endpoint> = endpoints
        .iter()
        .filter(|ep| ep.is_datagram() == mode.is_datagram())
        .filter(|ep| !secure || ep.is_secure())
        .cloned()
        .collect();

    if !secure {
        // Stable: original order is kept within each group
        usable.sort_by_key(|ep| ep.is_secure() != prefer_secure);
    }
    usable
}

/// Flags accepted after the endpoint list, besides `-t`
const TRAILING_FLAGS: [&str; 5] = ["-s", "-o", "-O", "-d", "-D"];

fn option_argument(
    text: &str,
    option: &str,
    tokens: &mut impl Iterator<Item = String>,
) -> Result<String> {
    tokens.next().ok_or_else(|| {
        RpcError::malformed(text, option, format!("{} requires an argument", option))
    })
}

fn apply_flag(
    text: &str,
    flag: &str,
    tokens: &mut impl Iterator<Item = String>,
    reference: &mut Reference,
    timeout: &mut Option<Option<Duration>>,
) -> Result<()> {
    match flag {
        "-t" => {
            let value = option_argument(text, flag, tokens)?;
            let parsed = parse_timeout(&value)
                .ok_or_else(|| RpcError::malformed(text, value.clone(), "invalid timeout"))?;
            *timeout = Some(parsed);
        }
        "-s" => reference.secure = true,
        "-o" => reference.mode = InvocationMode::Oneway,
        "-O" => reference.mode = InvocationMode::BatchOneway,
        "-d" => reference.mode = InvocationMode::Datagram,
        "-D" => reference.mode = InvocationMode::BatchDatagram,
        _ => return Err(RpcError::malformed(text, flag, "unknown option")),
    }
    Ok(())
}

/// Split the last endpoint's text at the first reference flag. Endpoint
/// options come in `-x value` pairs, so flags are only looked for in
/// option position; a `-t` before them belongs to the endpoint.
fn split_trailing_flags(text: &str) -> (String, Vec<String>) {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut at = 1;
    while at < tokens.len() && !TRAILING_FLAGS.contains(&tokens[at]) {
        at += 2;
    }
    let at = at.min(tokens.len());
    (
        tokens[..at].join(" "),
        tokens[at..].iter().map(|t| t.to_string()).collect(),
    )
}

fn parse_timeout(value: &str) -> Option<Option<Duration>> {
    match value.parse::<i64>().ok()? {
        -1 => Some(None),
        ms if ms > 0 => Some(Some(Duration::from_millis(ms as u64))),
        _ => None,
    }
}

/// Split at the first unquoted `:` or `@`
fn split_reference(text: &str) -> (&str, Option<(char, &str)>) {
    let mut in_quotes = false;
    let mut chars = text.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => {
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ':' | '@' if !in_quotes => return (&text[..i], Some((ch, &text[i + 1..]))),
            _ => {}
        }
    }
    (text, None)
}

/// Split endpoint text at the `:` that starts each endpoint. IPv6 hosts
/// contain colons, so only a colon followed by a transport name counts.
fn split_endpoints(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, _) in text.match_indices(':') {
        let rest = text[i + 1..].trim_start();
        let starts_endpoint = ["tcp", "ssl", "udp", "default"].iter().any(|kind| {
            rest.strip_prefix(*kind)
                .map_or(false, |after| after.is_empty() || after.starts_with(char::is_whitespace))
        });
        if starts_endpoint {
            parts.push(&text[start..i]);
            start = i + 1;
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Whitespace-separated tokens honoring double quotes
fn tokenize(reference: &str, text: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quotes = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                in_token = true;
            }
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_token = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            ch => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if in_quotes {
        return Err(RpcError::malformed(reference, text.trim(), "unterminated quote"));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

fn write_token(f: &mut fmt::Formatter<'_>, token: &str) -> fmt::Result {
    let needs_quotes = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '@' | '"'));
    if !needs_quotes {
        return f.write_str(token);
    }
    f.write_str("\"")?;
    for ch in token.chars() {
        if ch == '"' || ch == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{}", ch)?;
    }
    f.write_str("\"")
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_token(f, &self.identity.to_string())?;
        if !self.facet.is_empty() {
            f.write_str(" -f ")?;
            write_token(f, &self.facet)?;
        }
        if let Some(flag) = self.mode.flag() {
            write!(f, " {}", flag)?;
        }
        if self.secure {
            f.write_str(" -s")?;
        }
        match self.timeout {
            Some(timeout) => write!(f, " -t {}", timeout.as_millis())?,
            // Otherwise an endpoint -t would become the call timeout
            None if self.endpoints.iter().any(|ep| ep.timeout.is_some()) => {
                f.write_str(" -t -1")?
            }
            None => {}
        }
        if let Some(adapter_id) = &self.adapter_id {
            f.write_str(" @ ")?;
            write_token(f, adapter_id)?;
        } else {
            for endpoint in &self.endpoints {
                write!(f, ":{}", endpoint)?;
            }
        }
        Ok(())
    }
}
