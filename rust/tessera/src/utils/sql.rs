// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! SQL Parser utility

use snafu::location;
use datafusion::sql::sqlparser::{
    ast::{Expr, SelectItem, SetExpr, Statement},
    dialect::{Dialect, GenericDialect},
    parser::Parser,
    tokenizer::{Token, Tokenizer},
};

use crate::{Error, Result};

#[derive(Debug, Default)]
struct TesseraDialect(GenericDialect);

impl TesseraDialect {
    fn new() -> Self {
        Self(GenericDialect {})
    }
}

impl Dialect for TesseraDialect {
    fn is_identifier_start(&self, ch: char) -> bool {
        self.0.is_identifier_start(ch)
    }

    fn is_identifier_part(&self, ch: char) -> bool {
        self.0.is_identifier_part(ch)
    }

    fn is_delimited_identifier_start(&self, ch: char) -> bool {
        ch == '`'
    }
}

/// Parse a full statement, accepting `==` as `=`.
fn parse_statement(statement: &str) -> Result<Statement> {
    let dialect = TesseraDialect::new();

    let mut tokenizer = Tokenizer::new(&dialect, statement);
    let mut tokens = Vec::new();
    let mut token_iter = tokenizer.tokenize()?.into_iter();
    let Some(mut prev_token) = token_iter.next() else {
        return Err(Error::invalid_input(
            format!("Expression is empty: {statement}"),
            location!(),
        ));
    };
    for next_token in token_iter {
        if let (Token::Eq, Token::Eq) = (&prev_token, &next_token) {
            continue; // skip second equals
        }
        let token = std::mem::replace(&mut prev_token, next_token);
        tokens.push(token);
    }
    tokens.push(prev_token);

    Ok(Parser::new(&dialect)
        .with_tokens(tokens)
        .parse_statement()?)
}

/// Parse sql filter to Expression.
pub fn parse_sql_filter(filter: &str) -> Result<Expr> {
    let statement = parse_statement(&format!("SELECT 1 FROM t WHERE {filter}"))?;

    let selection = if let Statement::Query(query) = &statement {
        if let SetExpr::Select(s) = query.body.as_ref() {
            s.selection.as_ref()
        } else {
            None
        }
    } else {
        None
    };
    let expr = selection.ok_or_else(|| {
        Error::invalid_input(format!("Filter is not valid: {filter}"), location!())
    })?;
    Ok(expr.clone())
}

/// Parse a single sql expression, as used in projections.
pub fn parse_sql_expr(expr: &str) -> Result<Expr> {
    let statement = parse_statement(&format!("SELECT {expr}"))?;

    let selection = if let Statement::Query(query) = &statement {
        if let SetExpr::Select(s) = query.body.as_ref() {
            match s.projection.as_slice() {
                [SelectItem::UnnamedExpr(expr)] => Some(expr),
                _ => None,
            }
        } else {
            None
        }
    } else {
        None
    };
    let expr = selection.ok_or_else(|| {
        Error::invalid_input(format!("Expression is not valid: {expr}"), location!())
    })?;
    Ok(expr.clone())
}
