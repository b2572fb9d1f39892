use std::str::FromStr;

use chumsky::prelude::*;

use crate::error::{Result, SemError};

/// Relation operator connecting the left-hand variable to its terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelOp {
    /// `=~` - latent variable measured by its indicators.
    Measure,
    /// `~` - structural regression.
    Regress,
    /// `~~` - covariance or variance declaration.
    Cov,
}

impl ModelOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ModelOp::Measure => "=~",
            ModelOp::Regress => "~",
            ModelOp::Cov => "~~",
        }
    }
}

/// Modifier attached to a term, e.g. `0.5*x`, `NA*x`, `start(1)*x`, `lbl*x`.
#[derive(Debug, Clone, PartialEq)]
pub enum CoefSpec {
    /// Numeric modifier: the parameter is fixed at this value.
    Fixed(f64),
    /// `NA` modifier: force the parameter free, overriding defaults.
    Free,
    /// `start(v)` modifier: free with an explicit starting value.
    Start(f64),
    /// Identifier modifier: free, labelled; equal labels alias one parameter.
    Label(String),
    /// No modifier.
    None,
}

#[derive(Debug, Clone)]
pub struct Term {
    pub coef: CoefSpec,
    pub var: String,
}

/// One relation statement `lhs OP term1 + term2 + ...`.
#[derive(Debug, Clone)]
pub struct Line {
    pub lhs: String,
    pub op: ModelOp,
    pub terms: Vec<Term>,
}

/// Parsed model: the statement list, in source order.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub lines: Vec<Line>,
}

/// Parse a model description. Statements are separated by newlines or `;`;
/// `#` and `//` start comments. Name resolution and defaulting are not done
/// here - see the normalization pass in [`crate::model`].
pub fn parse_model(model: &str) -> Result<ModelSpec> {
    let mut lines = Vec::new();
    for raw_line in model.lines() {
        let stripped = strip_comments(raw_line);
        for segment in stripped.split(';') {
            let line = segment.trim();
            if line.is_empty() {
                continue;
            }
            lines.push(parse_line(line)?);
        }
    }
    Ok(ModelSpec { lines })
}

fn strip_comments(line: &str) -> String {
    let mut out = line.to_string();
    if let Some(idx) = out.find('#') {
        out.truncate(idx);
    }
    if let Some(idx) = out.find("//") {
        out.truncate(idx);
    }
    out
}

fn any_char<'a>()
-> impl Parser<'a, &'a str, char, chumsky::extra::Err<chumsky::error::Simple<'a, char>>> + Copy {
    any()
}

fn ident_parser<'a>()
-> impl Parser<'a, &'a str, String, chumsky::extra::Err<chumsky::error::Simple<'a, char>>> + Clone {
    let ident_start =
        any_char().filter(|c: &char| c.is_ascii_alphabetic() || *c == '_' || *c == '.');
    let ident_rest = any_char()
        .filter(|c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .repeated()
        .collect::<String>();
    ident_start
        .then(ident_rest)
        .map(|(first, rest)| {
            let mut s = String::new();
            s.push(first);
            s.push_str(&rest);
            s
        })
        .padded()
}

fn number_parser<'a>()
-> impl Parser<'a, &'a str, f64, chumsky::extra::Err<chumsky::error::Simple<'a, char>>> + Clone {
    let digits = any_char()
        .filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>();
    let sign = just('-').or(just('+')).or_not();
    let frac = just('.').then(digits.clone()).or_not();
    let exp = just('e')
        .or(just('E'))
        .then(just('-').or(just('+')).or_not())
        .then(digits.clone())
        .or_not();
    sign.then(digits)
        .then(frac)
        .then(exp)
        .map(|(((sign, int), frac), exp)| {
            let mut s = String::new();
            if let Some(sign) = sign {
                s.push(sign);
            }
            s.push_str(&int);
            if let Some((dot, frac)) = frac {
                s.push(dot);
                s.push_str(&frac);
            }
            if let Some(((e, sign), digits)) = exp {
                s.push(e);
                if let Some(sign) = sign {
                    s.push(sign);
                }
                s.push_str(&digits);
            }
            f64::from_str(&s).unwrap_or(f64::NAN)
        })
        .padded()
}

fn parse_line(line: &str) -> Result<Line> {
    let ident = ident_parser();
    let number = number_parser();

    let coef = choice((
        just("NA").to(CoefSpec::Free),
        just("start")
            .padded()
            .ignore_then(just('(').padded())
            .ignore_then(number.clone())
            .then_ignore(just(')').padded())
            .map(CoefSpec::Start),
        number.clone().map(CoefSpec::Fixed),
        ident.clone().map(CoefSpec::Label),
    ));

    let term = coef
        .then_ignore(just('*').padded())
        .then(ident.clone())
        .map(|(coef, var)| Term { coef, var })
        .or(ident.clone().map(|var| Term {
            coef: CoefSpec::None,
            var,
        }));

    let terms = term
        .separated_by(just('+').padded())
        .at_least(1)
        .collect::<Vec<_>>();

    let op = choice((
        just("=~").to(ModelOp::Measure),
        just("~~").to(ModelOp::Cov),
        just('~').to(ModelOp::Regress),
    ))
    .padded();

    let statement = ident
        .clone()
        .then(op)
        .then(terms)
        .then_ignore(end())
        .map(|((lhs, op), terms)| Line { lhs, op, terms });

    statement.parse(line).into_result().map_err(|errs| {
        let message = errs
            .into_iter()
            .map(|e: chumsky::error::Simple<char>| {
                format!("at {:?}: found {:?}", e.span(), e.found())
            })
            .collect::<Vec<_>>()
            .join("; ");
        SemError::Parse {
            line: line.to_string(),
            message,
        }
    })
}
