//! RDF terms and the record codec shared by checkpoints and journals.
//!
//! One statement is one self-contained line:
//!
//! ```text
//! <subject> <predicate> <object-or-literal> .
//! ```
//!
//! Literals are normalized when they are constructed, so two literals that
//! denote the same value compare equal and serialize to the same bytes:
//! - `xsd:dateTime` with an offset is rewritten to UTC (`...Z`)
//! - `xsd:dateTimeStamp` is always UTC
//! - `xsd:date` and `xsd:time` are re-rendered in their canonical lexical form
//! - the prefixed `xsd:string` datatype becomes the full XSD IRI
//!
//! Lexical forms that fail to parse are kept verbatim.

use crate::config::{
    XSD_DATE, XSD_DATE_TIME, XSD_DATE_TIME_STAMP, XSD_STRING, XSD_STRING_PREFIXED, XSD_TIME,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource: an absolute IRI or a blank node label (without `_:`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Node {
    Iri(String),
    Blank(String),
}

impl Node {
    pub fn iri(iri: impl Into<String>) -> Self {
        Node::Iri(iri.into())
    }

    pub fn blank(label: impl Into<String>) -> Self {
        Node::Blank(label.into())
    }

    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Node::Iri(iri) => Some(iri),
            Node::Blank(_) => None,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Iri(iri) => write_iri(f, iri),
            Node::Blank(label) => {
                f.write_str("_:")?;
                write_uchar_escaped(f, label, is_label_reserved)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
enum Annotation {
    Datatype(String),
    Language(String),
}

/// A literal value with either a datatype or a language tag.
///
/// Only constructible through [`Literal::typed`], [`Literal::string`] and
/// [`Literal::lang`], which apply normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Literal {
    lexical: String,
    annotation: Annotation,
}

impl Literal {
    pub fn typed(lexical: impl Into<String>, datatype: impl Into<String>) -> Self {
        let datatype = normalize_datatype(datatype.into());
        let lexical = normalize_lexical(lexical.into(), &datatype);
        Self {
            lexical,
            annotation: Annotation::Datatype(datatype),
        }
    }

    pub fn string(lexical: impl Into<String>) -> Self {
        Self::typed(lexical, XSD_STRING)
    }

    pub fn lang(lexical: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            lexical: lexical.into(),
            annotation: Annotation::Language(lang.into()),
        }
    }

    pub fn lexical(&self) -> &str {
        &self.lexical
    }

    pub fn datatype(&self) -> Option<&str> {
        match &self.annotation {
            Annotation::Datatype(dt) => Some(dt),
            Annotation::Language(_) => None,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match &self.annotation {
            Annotation::Language(lang) => Some(lang),
            Annotation::Datatype(_) => None,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", escape(&self.lexical))?;
        match &self.annotation {
            Annotation::Datatype(dt) => {
                f.write_str("^^")?;
                write_iri(f, dt)
            }
            Annotation::Language(lang) => write!(f, "@{}", lang),
        }
    }
}

/// Object position: a resource or a literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Object {
    Node(Node),
    Literal(Literal),
}

impl Object {
    pub fn iri(iri: impl Into<String>) -> Self {
        Object::Node(Node::iri(iri))
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Object::Node(node) => Some(node),
            Object::Literal(_) => None,
        }
    }
}

impl From<Node> for Object {
    fn from(node: Node) -> Self {
        Object::Node(node)
    }
}

impl From<Literal> for Object {
    fn from(literal: Literal) -> Self {
        Object::Literal(literal)
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Node(node) => node.fmt(f),
            Object::Literal(literal) => literal.fmt(f),
        }
    }
}

/// A single statement. Ordering is subject, predicate, object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Node,
    /// Predicate IRI.
    pub predicate: String,
    pub object: Object,
}

impl Triple {
    pub fn new(subject: Node, predicate: impl Into<String>, object: impl Into<Object>) -> Self {
        Self {
            subject,
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    /// Render the full record, terminator included, into one buffer.
    pub fn to_record(&self) -> String {
        let mut record = self.to_string();
        record.push('\n');
        record
    }

    /// Parse one record line (with or without its trailing newline).
    pub fn parse_record(line: &str) -> Result<Triple, String> {
        let mut cursor = Cursor::new(line.trim_end_matches(['\n', '\r']));
        let subject = cursor.node()?;
        let predicate = match cursor.node()? {
            Node::Iri(iri) => iri,
            Node::Blank(label) => return Err(format!("blank node _:{} in predicate position", label)),
        };
        let object = cursor.object()?;
        cursor.skip_ws();
        if !cursor.eat('.') {
            return Err("expected '.' after object".to_string());
        }
        cursor.skip_ws();
        if !cursor.rest().is_empty() && !cursor.rest().starts_with('#') {
            return Err(format!("trailing content: {}", cursor.rest()));
        }
        Ok(Triple {
            subject,
            predicate,
            object,
        })
    }
}

impl Triple {
    /// Check the parts the record encoding cannot escape: blank node labels
    /// must be non-empty and language tags must be `alpha(-alphanum)*`.
    pub fn validate(&self) -> Result<(), String> {
        let blank_ok = |node: &Node| match node {
            Node::Blank(label) if label.is_empty() => Err("empty blank node label".to_string()),
            _ => Ok(()),
        };
        blank_ok(&self.subject)?;
        match &self.object {
            Object::Node(node) => blank_ok(node),
            Object::Literal(literal) => match literal.language() {
                Some(tag) if !is_language_tag(tag) => {
                    Err(format!("invalid language tag {:?}", tag))
                }
                _ => Ok(()),
            },
        }
    }
}

fn is_language_tag(tag: &str) -> bool {
    let mut parts = tag.split('-');
    let primary_ok = parts
        .next()
        .is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphabetic()));
    primary_ok && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Characters that may not appear raw between `<` and `>`.
fn is_iri_reserved(c: char) -> bool {
    matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\') || c <= ' '
}

fn is_label_reserved(c: char) -> bool {
    c == '\\' || c <= ' '
}

fn write_iri(f: &mut fmt::Formatter<'_>, iri: &str) -> fmt::Result {
    f.write_str("<")?;
    write_uchar_escaped(f, iri, is_iri_reserved)?;
    f.write_str(">")
}

/// Write `s`, replacing every reserved character with a `\uXXXX` escape.
fn write_uchar_escaped(f: &mut fmt::Formatter<'_>, s: &str, reserved: fn(char) -> bool) -> fmt::Result {
    for c in s.chars() {
        if reserved(c) {
            write!(f, "\\u{:04X}", c as u32)?;
        } else {
            write!(f, "{}", c)?;
        }
    }
    Ok(())
}

/// Decode `\uXXXX` and `\UXXXXXXXX` escapes.
fn unescape_uchar(s: &str) -> Result<String, String> {
    if !s.contains('\\') {
        return Ok(s.to_string());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits = match chars.next() {
            Some('u') => 4,
            Some('U') => 8,
            other => return Err(format!("unknown escape \\{}", other.map(String::from).unwrap_or_default())),
        };
        let hex: String = chars.by_ref().take(digits).collect();
        let decoded = (hex.len() == digits)
            .then(|| u32::from_str_radix(&hex, 16).ok())
            .flatten()
            .and_then(char::from_u32)
            .ok_or_else(|| format!("bad escape \\u{}", hex))?;
        out.push(decoded);
    }
    Ok(out)
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.subject)?;
        write_iri(f, &self.predicate)?;
        write!(f, " {} .", self.object)
    }
}

fn normalize_datatype(datatype: String) -> String {
    if datatype == XSD_STRING_PREFIXED {
        XSD_STRING.to_string()
    } else {
        datatype
    }
}

fn normalize_lexical(lexical: String, datatype: &str) -> String {
    let normalized = match datatype {
        XSD_DATE_TIME => normalize_date_time(&lexical, false),
        XSD_DATE_TIME_STAMP => normalize_date_time(&lexical, true),
        XSD_DATE => NaiveDate::parse_from_str(&lexical, "%Y-%m-%d")
            .ok()
            .map(|d| d.format("%Y-%m-%d").to_string()),
        XSD_TIME => NaiveTime::parse_from_str(&lexical, "%H:%M:%S%.f")
            .ok()
            .map(|t| t.format("%H:%M:%S%.f").to_string()),
        _ => None,
    };
    normalized.unwrap_or(lexical)
}

fn normalize_date_time(lexical: &str, force_utc: bool) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(lexical) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
    }
    let naive = NaiveDateTime::parse_from_str(lexical, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    if force_utc {
        Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
    } else {
        Some(naive.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
    }
}

fn escape(lexical: &str) -> String {
    let mut out = String::with_capacity(lexical.len());
    for c in lexical.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start_matches([' ', '\t']).len();
    }

    fn eat(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn iri(&mut self) -> Result<String, String> {
        let rest = self.rest();
        let end = rest
            .find('>')
            .ok_or_else(|| "unterminated IRI".to_string())?;
        let iri = unescape_uchar(&rest[..end])?;
        self.pos += end + 1;
        Ok(iri)
    }

    fn node(&mut self) -> Result<Node, String> {
        self.skip_ws();
        if self.eat('<') {
            return self.iri().map(Node::Iri);
        }
        if self.rest().starts_with("_:") {
            self.pos += 2;
            let rest = self.rest();
            let end = rest.find([' ', '\t']).unwrap_or(rest.len());
            if end == 0 {
                return Err("empty blank node label".to_string());
            }
            self.pos += end;
            return unescape_uchar(&rest[..end]).map(Node::Blank);
        }
        Err(format!("expected IRI or blank node at: {}", self.rest()))
    }

    fn object(&mut self) -> Result<Object, String> {
        self.skip_ws();
        if !self.rest().starts_with('"') {
            return self.node().map(Object::Node);
        }
        self.pos += 1;
        let lexical = self.quoted()?;
        if self.rest().starts_with("^^<") {
            self.pos += 3;
            let datatype = self.iri()?;
            return Ok(Object::Literal(Literal::typed(lexical, datatype)));
        }
        if self.eat('@') {
            let rest = self.rest();
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
                .unwrap_or(rest.len());
            if end == 0 {
                return Err("empty language tag".to_string());
            }
            self.pos += end;
            return Ok(Object::Literal(Literal::lang(lexical, &rest[..end])));
        }
        Ok(Object::Literal(Literal::string(lexical)))
    }

    /// Read an escaped string body; the opening quote is already consumed.
    fn quoted(&mut self) -> Result<String, String> {
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(out);
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, other)) => return Err(format!("unknown escape \\{}", other)),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err("unterminated string literal".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RDF_TYPE;

    fn doc(id: &str) -> Node {
        Node::iri(format!("http://example.org/D/doc/{}", id))
    }

    #[test]
    fn test_iri_record() {
        let t = Triple::new(doc("1"), RDF_TYPE, Object::iri("http://example.org/Thing"));
        assert_eq!(
            t.to_record(),
            "<http://example.org/D/doc/1> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.org/Thing> .\n"
        );
        assert_eq!(Triple::parse_record(&t.to_record()).unwrap(), t);
    }

    #[test]
    fn test_typed_literal_record() {
        let t = Triple::new(
            doc("1"),
            "http://example.org/age",
            Literal::typed("42", "http://www.w3.org/2001/XMLSchema#integer"),
        );
        let record = t.to_record();
        assert!(record.contains("\"42\"^^<http://www.w3.org/2001/XMLSchema#integer>"));
        assert_eq!(Triple::parse_record(&record).unwrap(), t);
    }

    #[test]
    fn test_lang_literal_record() {
        let t = Triple::new(doc("1"), "http://example.org/label", Literal::lang("chat", "fr"));
        let record = t.to_record();
        assert!(record.ends_with("\"chat\"@fr .\n"));
        assert_eq!(Triple::parse_record(&record).unwrap(), t);
    }

    #[test]
    fn test_escaped_string_survives() {
        let lexical = "line one\nsays \"hi\"\t\\ done";
        let t = Triple::new(doc("2"), "http://example.org/comment", Literal::string(lexical));
        let record = t.to_record();
        assert_eq!(record.matches('\n').count(), 1);
        let parsed = Triple::parse_record(&record).unwrap();
        match parsed.object {
            Object::Literal(lit) => assert_eq!(lit.lexical(), lexical),
            other => panic!("expected literal, got {:?}", other),
        }
    }

    #[test]
    fn test_string_datatype_spellings_normalize() {
        let prefixed = Literal::typed("x", XSD_STRING_PREFIXED);
        let full = Literal::typed("x", XSD_STRING);
        assert_eq!(prefixed, full);
        assert_eq!(prefixed.datatype(), Some(XSD_STRING));
        let parsed = Triple::parse_record("<http://a> <http://b> \"x\"^^<xsd:string> .").unwrap();
        assert_eq!(parsed.object, Object::Literal(full));
    }

    #[test]
    fn test_plain_literal_is_string() {
        let parsed = Triple::parse_record("<http://a> <http://b> \"x\" .").unwrap();
        assert_eq!(parsed.object, Object::Literal(Literal::string("x")));
    }

    #[test]
    fn test_date_time_with_offset_becomes_utc() {
        let lit = Literal::typed("2024-01-15T10:30:00+05:00", XSD_DATE_TIME);
        assert_eq!(lit.lexical(), "2024-01-15T05:30:00Z");
    }

    #[test]
    fn test_date_time_without_zone_kept_naive() {
        let lit = Literal::typed("2024-01-15T10:30:00", XSD_DATE_TIME);
        assert_eq!(lit.lexical(), "2024-01-15T10:30:00");
    }

    #[test]
    fn test_date_time_stamp_forced_utc() {
        let lit = Literal::typed("2024-01-15T10:30:00", XSD_DATE_TIME_STAMP);
        assert_eq!(lit.lexical(), "2024-01-15T10:30:00Z");
    }

    #[test]
    fn test_date_and_time_canonical() {
        assert_eq!(Literal::typed("2024-1-5", XSD_DATE).lexical(), "2024-01-05");
        assert_eq!(Literal::typed("9:05:00", XSD_TIME).lexical(), "09:05:00");
    }

    #[test]
    fn test_unparseable_temporal_kept() {
        assert_eq!(Literal::typed("yesterday", XSD_DATE).lexical(), "yesterday");
    }

    #[test]
    fn test_blank_nodes() {
        let parsed = Triple::parse_record("_:b0 <http://b> _:b1 .").unwrap();
        assert_eq!(parsed.subject, Node::blank("b0"));
        assert_eq!(parsed.object, Object::Node(Node::blank("b1")));
        assert_eq!(parsed.to_string(), "_:b0 <http://b> _:b1 .");
    }

    #[test]
    fn test_reserved_iri_characters_round_trip() {
        let t = Triple::new(
            Node::iri("http://ex/a>b c\nd"),
            "http://ex/p{q}",
            Literal::typed("1", "http://ex/dt|\\"),
        );
        let record = t.to_record();
        assert_eq!(record.matches('\n').count(), 1);
        assert!(record.starts_with("<http://ex/a\\u003Eb\\u0020c\\u000Ad> "));
        assert_eq!(Triple::parse_record(&record).unwrap(), t);
    }

    #[test]
    fn test_blank_label_with_space_round_trips() {
        let t = Triple::new(Node::blank("b 0"), "http://ex/p", Node::blank("x\\y"));
        let record = t.to_record();
        assert_eq!(Triple::parse_record(&record).unwrap(), t);
    }

    #[test]
    fn test_plain_iris_unchanged() {
        let t = Triple::new(doc("1"), RDF_TYPE, Object::iri("http://example.org/Thing#x?y=1&z"));
        assert_eq!(
            t.to_string(),
            "<http://example.org/D/doc/1> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> <http://example.org/Thing#x?y=1&z> ."
        );
    }

    #[test]
    fn test_uchar_escapes_decoded() {
        let parsed = Triple::parse_record("<http://ex/\\u00E9> <http://ex/p> <http://ex/\\U0001F600> .").unwrap();
        assert_eq!(parsed.subject, Node::iri("http://ex/\u{e9}"));
        assert_eq!(parsed.object, Object::iri("http://ex/\u{1F600}"));
        assert!(Triple::parse_record("<http://ex/\\u00> <http://ex/p> <http://ex/o> .").is_err());
        assert!(Triple::parse_record("<http://ex/\\q> <http://ex/p> <http://ex/o> .").is_err());
    }

    #[test]
    fn test_validate_rejects_unencodable_parts() {
        let ok = Triple::new(doc("1"), "http://ex/label", Literal::lang("chat", "fr-CA"));
        assert!(ok.validate().is_ok());
        let bad_tag = Triple::new(doc("1"), "http://ex/label", Literal::lang("chat", "fr CA"));
        assert!(bad_tag.validate().is_err());
        let empty_blank = Triple::new(Node::blank(""), "http://ex/p", doc("1"));
        assert!(empty_blank.validate().is_err());
    }

    #[test]
    fn test_malformed_records_rejected() {
        assert!(Triple::parse_record("<http://a> <http://b> <http://c>").is_err());
        assert!(Triple::parse_record("<http://a> _:p <http://c> .").is_err());
        assert!(Triple::parse_record("<http://a> <http://b> \"open .").is_err());
        assert!(Triple::parse_record("<http://a> <http://b> <http://c> . extra").is_err());
    }
}
