//! Structured predicates over property snapshots.
//!
//! Filters use the parenthesized prefix grammar familiar from directory
//! services: `(&(interfaces=svc.Echo)(service.rank>=5))`. Matching is a pure
//! function of the filter and one property snapshot, so callers can evaluate
//! the same filter against pre- and post-update snapshots without the
//! registry's involvement.

use crate::error::{RegistryError, Result};
use crate::props::{Properties, Value};

/// One segment of a substring pattern such as `foo*bar*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPart {
	Literal(Box<str>),
	/// An unescaped `*`.
	Any,
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
	And(Vec<Filter>),
	Or(Vec<Filter>),
	Not(Box<Filter>),
	/// `(attr=value)`
	Eq { attr: Box<str>, value: Box<str> },
	/// `(attr>=value)`
	Gte { attr: Box<str>, value: Box<str> },
	/// `(attr<=value)`
	Lte { attr: Box<str>, value: Box<str> },
	/// `(attr=*)`
	Present { attr: Box<str> },
	/// `(attr=foo*bar)` and friends.
	Substring { attr: Box<str>, parts: Vec<SubPart> },
	/// Matches every snapshot; not expressible in the string grammar.
	MatchAll,
}

impl Filter {
	/// A filter that matches every record.
	pub fn match_all() -> Self {
		Filter::MatchAll
	}

	/// Parses a predicate string.
	pub fn parse(input: &str) -> Result<Self> {
		let mut parser = Parser {
			bytes: input.as_bytes(),
			pos: 0,
		};
		let filter = parser.parse_filter()?;
		parser.skip_ws();
		if parser.pos != parser.bytes.len() {
			return Err(parser.fail("trailing input after filter"));
		}
		Ok(filter)
	}

	/// Evaluates this filter against one property snapshot.
	pub fn matches(&self, props: &Properties) -> bool {
		match self {
			Filter::And(subs) => subs.iter().all(|f| f.matches(props)),
			Filter::Or(subs) => subs.iter().any(|f| f.matches(props)),
			Filter::Not(sub) => !sub.matches(props),
			Filter::Eq { attr, value } => {
				props.get(attr).is_some_and(|v| compare_eq(v, value))
			}
			Filter::Gte { attr, value } => props
				.get(attr)
				.is_some_and(|v| compare_ord(v, value).is_some_and(|o| o.is_ge())),
			Filter::Lte { attr, value } => props
				.get(attr)
				.is_some_and(|v| compare_ord(v, value).is_some_and(|o| o.is_le())),
			Filter::Present { attr } => props.get(attr).is_some(),
			Filter::Substring { attr, parts } => {
				props.get(attr).is_some_and(|v| substring_matches(v, parts))
			}
			Filter::MatchAll => true,
		}
	}
}

/// Equality with type coercion driven by the property value's type. A list
/// matches when any element matches.
fn compare_eq(value: &Value, literal: &str) -> bool {
	match value {
		Value::Str(s) => &**s == literal,
		Value::Int(i) => literal.trim().parse::<i64>() == Ok(*i),
		Value::Float(f) => literal.trim().parse::<f64>() == Ok(*f),
		Value::Bool(b) => literal.trim().parse::<bool>() == Ok(*b),
		Value::List(items) => items.iter().any(|item| compare_eq(item, literal)),
	}
}

/// Ordering with the same coercion rules; `None` when the literal does not
/// parse as the property's type. Lists compare through their elements: an
/// equal element wins outright, otherwise the first comparable one decides.
fn compare_ord(value: &Value, literal: &str) -> Option<std::cmp::Ordering> {
	match value {
		Value::Str(s) => Some((**s).cmp(literal)),
		Value::Int(i) => literal
			.trim()
			.parse::<i64>()
			.ok()
			.map(|rhs| i.cmp(&rhs)),
		Value::Float(f) => literal
			.trim()
			.parse::<f64>()
			.ok()
			.and_then(|rhs| f.partial_cmp(&rhs)),
		Value::Bool(_) => None,
		Value::List(items) => {
			// Any comparable element decides; prefer one that would satisfy
			// either bound by reporting Equal when present.
			let mut first = None;
			for item in items {
				if let Some(ord) = compare_ord(item, literal) {
					if ord == std::cmp::Ordering::Equal {
						return Some(ord);
					}
					first.get_or_insert(ord);
				}
			}
			first
		}
	}
}

fn substring_matches(value: &Value, parts: &[SubPart]) -> bool {
	match value {
		Value::Str(s) => substring_matches_str(s, parts),
		Value::List(items) => items.iter().any(|item| substring_matches(item, parts)),
		_ => false,
	}
}

fn substring_matches_str(s: &str, parts: &[SubPart]) -> bool {
	let mut remaining = s;
	let mut anchored = true;
	for (idx, part) in parts.iter().enumerate() {
		match part {
			SubPart::Any => anchored = false,
			SubPart::Literal(lit) => {
				let is_last = idx == parts.len() - 1;
				if is_last && anchored {
					return remaining == &**lit;
				}
				if is_last {
					return remaining.ends_with(&**lit);
				}
				if anchored {
					match remaining.strip_prefix(&**lit) {
						Some(rest) => remaining = rest,
						None => return false,
					}
				} else {
					match remaining.find(&**lit) {
						Some(at) => remaining = &remaining[at + lit.len()..],
						None => return false,
					}
					anchored = true;
				}
			}
		}
	}
	// Pattern ended with `*` (or was all wildcards): anything left matches.
	!anchored || remaining.is_empty()
}

struct Parser<'a> {
	bytes: &'a [u8],
	pos: usize,
}

impl<'a> Parser<'a> {
	fn fail(&self, reason: &'static str) -> RegistryError {
		RegistryError::FilterSyntax {
			position: self.pos,
			reason,
		}
	}

	fn skip_ws(&mut self) {
		while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
			self.pos += 1;
		}
	}

	fn expect(&mut self, byte: u8, reason: &'static str) -> Result<()> {
		if self.bytes.get(self.pos) == Some(&byte) {
			self.pos += 1;
			Ok(())
		} else {
			Err(self.fail(reason))
		}
	}

	fn peek(&self) -> Option<u8> {
		self.bytes.get(self.pos).copied()
	}

	fn parse_filter(&mut self) -> Result<Filter> {
		self.skip_ws();
		self.expect(b'(', "expected '('")?;
		self.skip_ws();
		let filter = match self.peek() {
			Some(b'&') => {
				self.pos += 1;
				Filter::And(self.parse_list()?)
			}
			Some(b'|') => {
				self.pos += 1;
				Filter::Or(self.parse_list()?)
			}
			Some(b'!') => {
				self.pos += 1;
				Filter::Not(Box::new(self.parse_filter()?))
			}
			Some(_) => self.parse_comparison()?,
			None => return Err(self.fail("unexpected end of filter")),
		};
		self.skip_ws();
		self.expect(b')', "expected ')'")?;
		Ok(filter)
	}

	fn parse_list(&mut self) -> Result<Vec<Filter>> {
		let mut subs = Vec::new();
		loop {
			self.skip_ws();
			if self.peek() == Some(b'(') {
				subs.push(self.parse_filter()?);
			} else if subs.is_empty() {
				return Err(self.fail("composite filter needs at least one operand"));
			} else {
				return Ok(subs);
			}
		}
	}

	fn parse_comparison(&mut self) -> Result<Filter> {
		let attr = self.parse_attr()?;
		match self.peek() {
			Some(b'=') => {
				self.pos += 1;
				self.parse_rhs(attr)
			}
			Some(b'>') => {
				self.pos += 1;
				self.expect(b'=', "expected '=' after '>'")?;
				let value = self.parse_value()?.literal(self)?;
				Ok(Filter::Gte { attr, value })
			}
			Some(b'<') => {
				self.pos += 1;
				self.expect(b'=', "expected '=' after '<'")?;
				let value = self.parse_value()?.literal(self)?;
				Ok(Filter::Lte { attr, value })
			}
			_ => Err(self.fail("expected '=', '>=' or '<='")),
		}
	}

	fn parse_attr(&mut self) -> Result<Box<str>> {
		let start = self.pos;
		while let Some(b) = self.peek() {
			if matches!(b, b'=' | b'>' | b'<' | b'(' | b')') {
				break;
			}
			self.pos += 1;
		}
		let attr = std::str::from_utf8(&self.bytes[start..self.pos])
			.map_err(|_| self.fail("attribute is not valid UTF-8"))?
			.trim();
		if attr.is_empty() {
			return Err(self.fail("empty attribute name"));
		}
		Ok(attr.into())
	}

	/// Everything after `=`: presence, substring, or plain equality.
	fn parse_rhs(&mut self, attr: Box<str>) -> Result<Filter> {
		let value = self.parse_value()?;
		if value.parts.len() == 1 && value.parts[0] == SubPart::Any {
			return Ok(Filter::Present { attr });
		}
		if value.parts.iter().any(|p| *p == SubPart::Any) {
			return Ok(Filter::Substring {
				attr,
				parts: value.parts,
			});
		}
		Ok(Filter::Eq {
			attr,
			value: value.literal(self)?,
		})
	}

	fn parse_value(&mut self) -> Result<ParsedValue> {
		let mut parts = Vec::new();
		let mut current = String::new();
		loop {
			match self.peek() {
				Some(b')') | None => break,
				Some(b'(') => return Err(self.fail("unescaped '(' in value")),
				Some(b'*') => {
					self.pos += 1;
					if !current.is_empty() {
						parts.push(SubPart::Literal(std::mem::take(&mut current).into()));
					}
					if parts.last() != Some(&SubPart::Any) {
						parts.push(SubPart::Any);
					}
				}
				Some(b'\\') => {
					self.pos += 1;
					match self.peek() {
						Some(b) => {
							current.push(b as char);
							self.pos += 1;
						}
						None => return Err(self.fail("dangling escape")),
					}
				}
				Some(_) => {
					// Consume one UTF-8 scalar.
					let rest = std::str::from_utf8(&self.bytes[self.pos..])
						.map_err(|_| self.fail("value is not valid UTF-8"))?;
					let ch = rest.chars().next().ok_or_else(|| self.fail("unexpected end"))?;
					current.push(ch);
					self.pos += ch.len_utf8();
				}
			}
		}
		if !current.is_empty() {
			parts.push(SubPart::Literal(current.into()));
		}
		if parts.is_empty() {
			return Err(self.fail("empty value"));
		}
		Ok(ParsedValue { parts })
	}
}

struct ParsedValue {
	parts: Vec<SubPart>,
}

impl ParsedValue {
	/// The single literal this value must be for Eq/Gte/Lte positions.
	fn literal(mut self, parser: &Parser<'_>) -> Result<Box<str>> {
		if self.parts.len() == 1 {
			if let Some(SubPart::Literal(lit)) = self.parts.pop() {
				return Ok(lit);
			}
		}
		Err(parser.fail("wildcard not allowed in ordered comparison"))
	}
}
