//! RFC 4515 search filters.
//!
//! The same [`Filter`] value is rendered to its string form for LDAP servers
//! and evaluated directly against an [`Attributes`] bag by the in-memory
//! directory.

use std::{cmp::Ordering, fmt};

use oxsync_slo::{errors, Result};

use crate::entry::Attributes;

/// Active Directory bitwise matching rules.
const RULE_BIT_AND: &str = "1.2.840.113556.1.4.803";
const RULE_BIT_OR: &str = "1.2.840.113556.1.4.804";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal(String, String),
    Present(String),
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Approx(String, String),
    /// `attr:dn:rule:=value`; at least one of `attr` and `rule` is set.
    Extensible {
        attr: Option<String>,
        rule: Option<String>,
        dn: bool,
        value: String,
    },
}

impl Filter {
    pub fn equal<A: Into<String>, V: Into<String>>(attr: A, value: V) -> Self {
        Self::Equal(attr.into(), value.into())
    }

    pub fn present<A: Into<String>>(attr: A) -> Self {
        Self::Present(attr.into())
    }

    /// Conjunction that collapses to its only member and flattens nested
    /// conjunctions. An empty list matches everything.
    pub fn and(filters: Vec<Filter>) -> Self {
        let mut flat = Vec::with_capacity(filters.len());
        for f in filters {
            match f {
                Self::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Self::present("objectClass"),
            1 => flat.remove(0),
            _ => Self::And(flat),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        // bare `uid=a` is accepted the way most directory tools accept it
        let owned;
        let input = if input.starts_with('(') {
            input
        } else {
            owned = format!("({})", input);
            owned.as_str()
        };
        let mut parser = Parser {
            src: input.as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.src.len() {
            return Err(errors::bad_request(&format!(
                "unexpected trailing input at {} in filter {}",
                parser.pos, input
            )));
        }
        Ok(filter)
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(attrs)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(attrs)),
            Self::Not(filter) => !filter.matches(attrs),
            Self::Present(attr) => {
                attr.eq_ignore_ascii_case("objectClass") || attrs.contains(attr)
            }
            Self::Equal(attr, value) => values(attrs, attr)
                .iter()
                .any(|v| v.to_lowercase() == value.to_lowercase()),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => values(attrs, attr).iter().any(|v| {
                substring_match(
                    &v.to_lowercase(),
                    initial.as_deref(),
                    any,
                    last.as_deref(),
                )
            }),
            Self::GreaterOrEqual(attr, value) => values(attrs, attr)
                .iter()
                .any(|v| ordering(v, value) != Ordering::Less),
            Self::LessOrEqual(attr, value) => values(attrs, attr)
                .iter()
                .any(|v| ordering(v, value) != Ordering::Greater),
            Self::Approx(attr, value) => values(attrs, attr)
                .iter()
                .any(|v| v.to_lowercase() == value.to_lowercase()),
            Self::Extensible {
                attr: Some(attr),
                rule,
                value,
                ..
            } => values(attrs, attr)
                .iter()
                .any(|v| extensible_match(rule.as_deref(), v, value)),
            // matching by rule over every attribute is left to the server
            Self::Extensible { attr: None, .. } => false,
        }
    }
}

fn extensible_match(rule: Option<&str>, actual: &str, asserted: &str) -> bool {
    let bits = || Some((actual.parse::<i64>().ok()?, asserted.parse::<i64>().ok()?));
    match rule {
        None => actual.to_lowercase() == asserted.to_lowercase(),
        Some(RULE_BIT_AND) => bits().is_some_and(|(a, b)| (a & b) == b),
        Some(RULE_BIT_OR) => bits().is_some_and(|(a, b)| (a & b) != 0),
        Some(_) => false,
    }
}

fn values<'a>(attrs: &'a Attributes, attr: &str) -> &'a [String] {
    attrs.get(attr).unwrap_or_default()
}

fn ordering(left: &str, right: &str) -> Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

fn substring_match(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    last: Option<&str>,
) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

/// Escapes a value for use inside a filter string.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Or(filters) => {
                f.write_str("(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Not(filter) => write!(f, "(!{})", filter),
            Self::Equal(attr, value) => {
                write!(f, "({}={})", attr, escape(value))
            }
            Self::Present(attr) => write!(f, "({}=*)", attr),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({}=", attr)?;
                if let Some(initial) = initial {
                    f.write_str(&escape(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape(last))?;
                }
                f.write_str(")")
            }
            Self::GreaterOrEqual(attr, value) => {
                write!(f, "({}>={})", attr, escape(value))
            }
            Self::LessOrEqual(attr, value) => {
                write!(f, "({}<={})", attr, escape(value))
            }
            Self::Approx(attr, value) => {
                write!(f, "({}~={})", attr, escape(value))
            }
            Self::Extensible {
                attr,
                rule,
                dn,
                value,
            } => {
                f.write_str("(")?;
                if let Some(attr) = attr {
                    f.write_str(attr)?;
                }
                if *dn {
                    f.write_str(":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape(value))
            }
        }
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> errors::WithBacktrace {
        errors::bad_request(&format!(
            "{} at {} in filter {}",
            msg,
            self.pos,
            String::from_utf8_lossy(self.src)
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            return Ok(());
        }
        Err(self.error(&format!("expected '{}'", c as char)))
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.skip_ws();
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end")),
        };
        self.skip_ws();
        self.expect(b')')?;
        self.skip_ws();
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        self.skip_ws();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn token(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'-' || c == b';' || c == b'.'
            {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn item(&mut self) -> Result<Filter> {
        let attr = self.token();
        if self.peek() == Some(b':') {
            return self.extensible(attr);
        }
        if attr.is_empty() {
            return Err(self.error("missing attribute description"));
        }
        let op = match (self.peek(), self.src.get(self.pos + 1).copied()) {
            (Some(b'='), _) => {
                self.pos += 1;
                b'='
            }
            (Some(b'>' | b'<' | b'~'), Some(b'=')) => {
                let op = self.src[self.pos];
                self.pos += 2;
                op
            }
            _ => return Err(self.error("expected filter operator")),
        };
        let parts = self.value_parts()?;
        match op {
            b'>' => Ok(Filter::GreaterOrEqual(attr, join_single(parts)?)),
            b'<' => Ok(Filter::LessOrEqual(attr, join_single(parts)?)),
            b'~' => Ok(Filter::Approx(attr, join_single(parts)?)),
            _ => {
                if parts.len() == 1 {
                    return Ok(Filter::Equal(attr, parts.into_iter().collect()));
                }
                if parts.len() == 2 && parts.iter().all(String::is_empty) {
                    return Ok(Filter::Present(attr));
                }
                let mut parts = parts;
                let last = parts.pop().filter(|v| !v.is_empty());
                let initial = Some(parts.remove(0)).filter(|v| !v.is_empty());
                let any = parts.into_iter().filter(|v| !v.is_empty()).collect();
                Ok(Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                })
            }
        }
    }

    /// `[attr][:dn][:rule]:=value`, positioned on the first `:`.
    fn extensible(&mut self, attr: String) -> Result<Filter> {
        let mut dn = false;
        let mut rule = None;
        loop {
            self.expect(b':')?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let token = self.token();
            if token.is_empty() {
                return Err(self.error("expected matching rule"));
            }
            if token.eq_ignore_ascii_case("dn") && !dn && rule.is_none() {
                dn = true;
            } else if rule.is_none() {
                rule = Some(token);
            } else {
                return Err(self.error("expected ':='"));
            }
        }
        let attr = Some(attr).filter(|a| !a.is_empty());
        if attr.is_none() && rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a rule"));
        }
        Ok(Filter::Extensible {
            attr,
            rule,
            dn,
            value: join_single(self.value_parts()?)?,
        })
    }

    /// Reads an assertion value split on unescaped `*`.
    fn value_parts(&mut self) -> Result<Vec<String>> {
        let mut parts = vec![Vec::new()];
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated value")),
                Some(b')') => break,
                Some(b'(') => return Err(self.error("unescaped '('")),
                Some(b'*') => {
                    self.pos += 1;
                    parts.push(Vec::new());
                }
                Some(b'\\') => {
                    let hex = self
                        .src
                        .get(self.pos + 1..self.pos + 3)
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or_else(|| self.error("invalid escape"))?;
                    self.pos += 3;
                    if let Some(last) = parts.last_mut() {
                        last.push(hex);
                    }
                }
                Some(c) => {
                    self.pos += 1;
                    if let Some(last) = parts.last_mut() {
                        last.push(c);
                    }
                }
            }
        }
        parts
            .into_iter()
            .map(|p| {
                String::from_utf8(p).map_err(|_| self.error("invalid utf-8"))
            })
            .collect()
    }
}

fn join_single(parts: Vec<String>) -> Result<String> {
    if parts.len() != 1 {
        return Err(errors::bad_request("wildcard not allowed in this assertion"));
    }
    Ok(parts.into_iter().collect())
}
