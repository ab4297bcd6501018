// Copyright 2024 The PJJ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing of revset expressions into [`RevsetExpression`] trees.

use std::rc::Rc;

use chrono::{DateTime, NaiveDate, TimeZone as _, Utc};
use itertools::Itertools as _;
use pest::iterators::Pair;
use pest::Parser as _;
use pest_derive::Parser;
use thiserror::Error;

use crate::backend::MillisSinceEpoch;
use crate::error::{ClassifiedError, ErrorKind};
use crate::revset::{LastArg, RevsetExpression};
use crate::str_util::StringPattern;

#[derive(Parser)]
#[grammar = "revset.pest"]
struct RevsetParser;

const KNOWN_FUNCTIONS: &[&str] = &[
    "all",
    "none",
    "ancestors",
    "descendants",
    "roots",
    "heads",
    "latest",
    "author",
    "description",
    "empty",
    "mine",
    "merge",
    "file",
    "bookmarks",
    "bookmark",
    "tags",
    "parents",
    "children",
    "last",
    "since",
    "between",
    "common_ancestor",
    "range",
    "diverge_point",
    "connected",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevsetParseErrorKind {
    #[error("Syntax error: {0}")]
    SyntaxError(String),
    #[error("Revset function \"{0}\" doesn't exist")]
    NoSuchFunction(String),
    #[error("Invalid arguments to revset function \"{name}\": {message}")]
    InvalidFunctionArguments { name: String, message: String },
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),
    #[error("Invalid date \"{0}\"")]
    InvalidDate(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{kind}")]
pub struct RevsetParseError {
    pub kind: RevsetParseErrorKind,
    /// 1-based (line, column) into the source expression.
    pub position: Option<(usize, usize)>,
}

impl RevsetParseError {
    fn new(kind: RevsetParseErrorKind) -> Self {
        RevsetParseError {
            kind,
            position: None,
        }
    }

    fn with_span(kind: RevsetParseErrorKind, span: pest::Span<'_>) -> Self {
        RevsetParseError {
            kind,
            position: Some(span.start_pos().line_col()),
        }
    }
}

impl ClassifiedError for RevsetParseError {
    fn kind(&self) -> ErrorKind {
        match &self.kind {
            RevsetParseErrorKind::SyntaxError(_) | RevsetParseErrorKind::NoSuchFunction(_) => {
                ErrorKind::ParseError
            }
            RevsetParseErrorKind::InvalidFunctionArguments { .. }
            | RevsetParseErrorKind::InvalidPattern(_)
            | RevsetParseErrorKind::InvalidDate(_) => ErrorKind::InvalidArgument,
        }
    }

    fn suggestion(&self) -> Option<String> {
        match &self.kind {
            RevsetParseErrorKind::NoSuchFunction(name) => {
                let candidates = KNOWN_FUNCTIONS
                    .iter()
                    .filter(|known| strsim::jaro(known, name) > 0.8)
                    .collect_vec();
                if candidates.is_empty() {
                    None
                } else {
                    Some(format!("Did you mean {}?", candidates.iter().join(", ")))
                }
            }
            _ => None,
        }
    }
}

impl From<pest::error::Error<Rule>> for RevsetParseError {
    fn from(err: pest::error::Error<Rule>) -> Self {
        let position = match err.line_col {
            pest::error::LineColLocation::Pos(pos) => Some(pos),
            pest::error::LineColLocation::Span(pos, _) => Some(pos),
        };
        RevsetParseError {
            kind: RevsetParseErrorKind::SyntaxError(err.variant.message().into_owned()),
            position,
        }
    }
}

enum Argument {
    Expression(Rc<RevsetExpression>),
    String(String),
    Number(i64),
    Duration(i64),
    /// A bare symbol, usable as either an expression or pattern text.
    Symbol(String),
}

pub fn parse(text: &str) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let mut pairs = RevsetParser::parse(Rule::program, text)?;
    parse_expr(pairs.next().unwrap())
}

fn parse_expr(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    debug_assert_eq!(pair.as_rule(), Rule::expr);
    let mut inner = pair.into_inner();
    let mut expression = parse_inter_expr(inner.next().unwrap())?;
    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::union_op);
        let rhs = parse_inter_expr(inner.next().unwrap())?;
        expression = Rc::new(RevsetExpression::Union(expression, rhs));
    }
    Ok(expression)
}

fn parse_inter_expr(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let mut inner = pair.into_inner();
    let mut expression = parse_diff_expr(inner.next().unwrap())?;
    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::inter_op);
        let rhs = parse_diff_expr(inner.next().unwrap())?;
        expression = Rc::new(RevsetExpression::Intersection(expression, rhs));
    }
    Ok(expression)
}

fn parse_diff_expr(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let mut inner = pair.into_inner();
    let mut expression = parse_prefix_expr(inner.next().unwrap())?;
    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::diff_op);
        let rhs = parse_prefix_expr(inner.next().unwrap())?;
        expression = Rc::new(RevsetExpression::Difference(expression, rhs));
    }
    Ok(expression)
}

fn parse_prefix_expr(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let mut negated = false;
    let mut inner = pair.into_inner();
    let mut next = inner.next().unwrap();
    if next.as_rule() == Rule::neg_op {
        negated = true;
        next = inner.next().unwrap();
    }
    let expression = parse_postfix_expr(next)?;
    if negated {
        Ok(Rc::new(RevsetExpression::Complement(expression)))
    } else {
        Ok(expression)
    }
}

fn parse_postfix_expr(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let mut inner = pair.into_inner();
    let mut expression = parse_primary(inner.next().unwrap())?;
    for op in inner {
        expression = match op.as_rule() {
            Rule::parents_op => Rc::new(RevsetExpression::Parents(expression)),
            Rule::children_op => Rc::new(RevsetExpression::Children(expression)),
            other => panic!("unexpected postfix rule {other:?}"),
        };
    }
    Ok(expression)
}

fn unescape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut chars = content.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_primary(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let pair = pair.into_inner().next().unwrap();
    match pair.as_rule() {
        Rule::function => parse_function(pair),
        Rule::at_symbol => Ok(Rc::new(RevsetExpression::WorkingCopy)),
        Rule::expr => parse_expr(pair),
        Rule::string => {
            let content = pair.into_inner().next().unwrap();
            Ok(Rc::new(RevsetExpression::Symbol(unescape(
                content.as_str(),
            ))))
        }
        Rule::symbol => Ok(Rc::new(RevsetExpression::Symbol(pair.as_str().to_owned()))),
        other => panic!("unexpected primary rule {other:?}"),
    }
}

fn parse_argument(pair: Pair<'_, Rule>) -> Result<Argument, RevsetParseError> {
    let pair = pair.into_inner().next().unwrap();
    match pair.as_rule() {
        Rule::duration => {
            let text = pair.as_str();
            let (digits, unit) = text.split_at(text.len() - 1);
            let count: i64 = digits.parse().unwrap();
            let millis = match unit {
                "d" => count * 24 * 3600 * 1000,
                "h" => count * 3600 * 1000,
                _ => unreachable!(),
            };
            Ok(Argument::Duration(millis))
        }
        Rule::number => Ok(Argument::Number(pair.as_str().parse().unwrap())),
        Rule::string => {
            let content = pair.into_inner().next().unwrap();
            Ok(Argument::String(unescape(content.as_str())))
        }
        Rule::expr => {
            let expression = parse_expr(pair)?;
            if let RevsetExpression::Symbol(name) = expression.as_ref() {
                Ok(Argument::Symbol(name.clone()))
            } else {
                Ok(Argument::Expression(expression))
            }
        }
        other => panic!("unexpected argument rule {other:?}"),
    }
}

fn arity_error(name: &str, message: &str, span: pest::Span<'_>) -> RevsetParseError {
    RevsetParseError::with_span(
        RevsetParseErrorKind::InvalidFunctionArguments {
            name: name.to_owned(),
            message: message.to_owned(),
        },
        span,
    )
}

fn argument_to_expression(argument: Argument) -> Option<Rc<RevsetExpression>> {
    match argument {
        Argument::Expression(expression) => Some(expression),
        Argument::Symbol(name) => Some(Rc::new(RevsetExpression::Symbol(name))),
        // A bare number is a change-id prefix in expression position.
        Argument::Number(n) => Some(Rc::new(RevsetExpression::Symbol(n.to_string()))),
        _ => None,
    }
}

fn argument_to_text(argument: Argument) -> Option<String> {
    match argument {
        Argument::String(text) | Argument::Symbol(text) => Some(text),
        Argument::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_pattern(
    name: &str,
    argument: Argument,
    span: pest::Span<'_>,
) -> Result<StringPattern, RevsetParseError> {
    let text = argument_to_text(argument)
        .ok_or_else(|| arity_error(name, "expected a pattern", span))?;
    StringPattern::parse(&text).map_err(|err| {
        RevsetParseError::with_span(RevsetParseErrorKind::InvalidPattern(err.to_string()), span)
    })
}

fn parse_date(
    name: &str,
    argument: Argument,
    span: pest::Span<'_>,
) -> Result<MillisSinceEpoch, RevsetParseError> {
    let text = argument_to_text(argument)
        .ok_or_else(|| arity_error(name, "expected a date", span))?;
    if let Ok(datetime) = DateTime::parse_from_rfc3339(&text) {
        return Ok(MillisSinceEpoch(datetime.timestamp_millis()));
    }
    if let Ok(date) = text.parse::<NaiveDate>() {
        let datetime = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        return Ok(MillisSinceEpoch(datetime.timestamp_millis()));
    }
    Err(RevsetParseError::with_span(
        RevsetParseErrorKind::InvalidDate(text),
        span,
    ))
}

fn parse_function(pair: Pair<'_, Rule>) -> Result<Rc<RevsetExpression>, RevsetParseError> {
    let span = pair.as_span();
    let mut inner = pair.into_inner();
    let name_pair = inner.next().unwrap();
    let name = name_pair.as_str();
    let mut arguments = vec![];
    if let Some(args_pair) = inner.next() {
        for arg_pair in args_pair.into_inner() {
            arguments.push(parse_argument(arg_pair)?);
        }
    }
    let count = arguments.len();
    let mut arguments = arguments.into_iter();

    let expect_none = |count: usize| -> Result<(), RevsetParseError> {
        if count == 0 {
            Ok(())
        } else {
            Err(arity_error(name, "expected no arguments", span))
        }
    };
    let one_expr = |name: &str,
                    count: usize,
                    arguments: &mut dyn Iterator<Item = Argument>|
     -> Result<Rc<RevsetExpression>, RevsetParseError> {
        if count != 1 {
            return Err(arity_error(name, "expected one revset argument", span));
        }
        argument_to_expression(arguments.next().unwrap())
            .ok_or_else(|| arity_error(name, "expected one revset argument", span))
    };

    let expression = match name {
        "all" => {
            expect_none(count)?;
            RevsetExpression::All
        }
        "none" => {
            expect_none(count)?;
            RevsetExpression::None
        }
        "empty" => {
            expect_none(count)?;
            RevsetExpression::Empty
        }
        "mine" => {
            expect_none(count)?;
            RevsetExpression::Mine
        }
        "merge" => {
            expect_none(count)?;
            RevsetExpression::Merge
        }
        "bookmarks" => {
            expect_none(count)?;
            RevsetExpression::Bookmarks
        }
        "tags" => {
            expect_none(count)?;
            RevsetExpression::Tags
        }
        "ancestors" => RevsetExpression::Ancestors(one_expr(name, count, &mut arguments)?),
        "descendants" => RevsetExpression::Descendants(one_expr(name, count, &mut arguments)?),
        "parents" => RevsetExpression::Parents(one_expr(name, count, &mut arguments)?),
        "children" => RevsetExpression::Children(one_expr(name, count, &mut arguments)?),
        "connected" => RevsetExpression::Connected(one_expr(name, count, &mut arguments)?),
        "common_ancestor" => {
            RevsetExpression::CommonAncestor(one_expr(name, count, &mut arguments)?)
        }
        // heads()/roots() default to the whole graph.
        "heads" => match count {
            0 => RevsetExpression::Heads(Rc::new(RevsetExpression::All)),
            _ => RevsetExpression::Heads(one_expr(name, count, &mut arguments)?),
        },
        "roots" => match count {
            0 => RevsetExpression::Roots(Rc::new(RevsetExpression::All)),
            _ => RevsetExpression::Roots(one_expr(name, count, &mut arguments)?),
        },
        "latest" => {
            if count != 1 {
                return Err(arity_error(name, "expected a count", span));
            }
            match arguments.next().unwrap() {
                Argument::Number(n) if n >= 0 => RevsetExpression::Latest(n as usize),
                _ => return Err(arity_error(name, "expected a non-negative count", span)),
            }
        }
        "last" => {
            if count != 1 {
                return Err(arity_error(name, "expected a count or duration", span));
            }
            match arguments.next().unwrap() {
                Argument::Number(n) if n >= 0 => {
                    RevsetExpression::Last(LastArg::Count(n as usize))
                }
                Argument::Duration(millis) => RevsetExpression::Last(LastArg::Duration(millis)),
                _ => return Err(arity_error(name, "expected a count or duration", span)),
            }
        }
        "author" => {
            if count != 1 {
                return Err(arity_error(name, "expected a pattern", span));
            }
            RevsetExpression::Author(parse_pattern(name, arguments.next().unwrap(), span)?)
        }
        "description" => {
            if count != 1 {
                return Err(arity_error(name, "expected a pattern", span));
            }
            RevsetExpression::Description(parse_pattern(name, arguments.next().unwrap(), span)?)
        }
        "file" => {
            if count != 1 {
                return Err(arity_error(name, "expected a pattern", span));
            }
            RevsetExpression::File(parse_pattern(name, arguments.next().unwrap(), span)?)
        }
        "bookmark" => {
            if count != 1 {
                return Err(arity_error(name, "expected a bookmark name", span));
            }
            let text = argument_to_text(arguments.next().unwrap())
                .ok_or_else(|| arity_error(name, "expected a bookmark name", span))?;
            RevsetExpression::Bookmark(text)
        }
        "since" => {
            if count != 1 {
                return Err(arity_error(name, "expected a date", span));
            }
            RevsetExpression::Since(parse_date(name, arguments.next().unwrap(), span)?)
        }
        "between" => {
            if count != 2 {
                return Err(arity_error(name, "expected two dates", span));
            }
            let start = parse_date(name, arguments.next().unwrap(), span)?;
            let end = parse_date(name, arguments.next().unwrap(), span)?;
            RevsetExpression::Between(start, end)
        }
        "range" => {
            if count != 2 {
                return Err(arity_error(name, "expected two revsets", span));
            }
            let a = argument_to_expression(arguments.next().unwrap())
                .ok_or_else(|| arity_error(name, "expected two revsets", span))?;
            let b = argument_to_expression(arguments.next().unwrap())
                .ok_or_else(|| arity_error(name, "expected two revsets", span))?;
            RevsetExpression::Range(a, b)
        }
        "diverge_point" => {
            if count != 2 {
                return Err(arity_error(name, "expected two revsets", span));
            }
            let a = argument_to_expression(arguments.next().unwrap())
                .ok_or_else(|| arity_error(name, "expected two revsets", span))?;
            let b = argument_to_expression(arguments.next().unwrap())
                .ok_or_else(|| arity_error(name, "expected two revsets", span))?;
            RevsetExpression::DivergePoint(a, b)
        }
        _ => {
            return Err(RevsetParseError::with_span(
                RevsetParseErrorKind::NoSuchFunction(name.to_owned()),
                span,
            ))
        }
    };
    Ok(Rc::new(expression))
}
