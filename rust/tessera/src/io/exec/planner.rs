// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Exec plan planner

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::{Array, BooleanArray, RecordBatch};
use arrow_schema::{DataType as ArrowDataType, Field, SchemaRef, TimeUnit};
use datafusion::common::{Column, DFSchema};
use datafusion::functions::core::expr_fn::get_field;
use datafusion::logical_expr::{lit, Between, BinaryExpr, Cast, ExprSchemable, Like, Operator};
use datafusion::optimizer::simplify_expressions::{ExprSimplifier, SimplifyContext};
use datafusion::physical_expr::execution_props::ExecutionProps;
use datafusion::physical_expr::PhysicalExpr;
use datafusion::prelude::Expr;
use datafusion::scalar::ScalarValue;
use datafusion::sql::sqlparser::ast::{
    BinaryOperator, DataType as SQLDataType, ExactNumberInfo, Expr as SQLExpr, Ident,
    TimezoneInfo, UnaryOperator, Value,
};
use snafu::location;

use crate::utils::sql::{parse_sql_expr, parse_sql_filter};
use crate::{Error, Result};

/// Turns SQL text into DataFusion expressions over one Arrow schema.
///
/// [`Self::parse_filter`] and [`Self::parse_expr`] check column references
/// and types. The results go through [`Self::optimize_expr`] before
/// [`Self::create_physical_expr`] can evaluate them.
#[derive(Debug, Clone)]
pub struct Planner {
    schema: SchemaRef,
}

impl Planner {
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }

    fn df_schema(&self) -> Result<DFSchema> {
        Ok(DFSchema::try_from(self.schema.as_ref().clone())?)
    }

    /// A column reference. Trailing identifiers select fields of a struct.
    fn column(&self, idents: &[Ident]) -> Result<Expr> {
        let missing = || {
            let path = idents
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join(".");
            Error::invalid_input(format!("Column {path} does not exist"), location!())
        };
        let [first, rest @ ..] = idents else {
            return Err(missing());
        };

        let (_, mut field) = self.schema.column_with_name(&first.value).ok_or_else(missing)?;
        let mut column = Expr::Column(Column::from_name(first.value.clone()));
        for ident in rest {
            field = match field.data_type() {
                ArrowDataType::Struct(children) => children.find(&ident.value),
                _ => None,
            }
            .map(|(_, child)| child.as_ref())
            .ok_or_else(missing)?;
            column = get_field(column, ident.value.clone());
        }
        Ok(column)
    }

    fn binary_op(&self, op: &BinaryOperator) -> Result<Operator> {
        Ok(match op {
            BinaryOperator::Plus => Operator::Plus,
            BinaryOperator::Minus => Operator::Minus,
            BinaryOperator::Multiply => Operator::Multiply,
            BinaryOperator::Divide => Operator::Divide,
            BinaryOperator::Modulo => Operator::Modulo,
            BinaryOperator::StringConcat => Operator::StringConcat,
            BinaryOperator::Gt => Operator::Gt,
            BinaryOperator::Lt => Operator::Lt,
            BinaryOperator::GtEq => Operator::GtEq,
            BinaryOperator::LtEq => Operator::LtEq,
            BinaryOperator::Eq => Operator::Eq,
            BinaryOperator::NotEq => Operator::NotEq,
            BinaryOperator::And => Operator::And,
            BinaryOperator::Or => Operator::Or,
            _ => {
                return Err(Error::invalid_input(
                    format!("Operator {op} is not supported"),
                    location!(),
                ))
            }
        })
    }

    fn binary_expr(&self, left: &SQLExpr, op: &BinaryOperator, right: &SQLExpr) -> Result<Expr> {
        Ok(Expr::BinaryExpr(BinaryExpr::new(
            Box::new(self.parse_sql_expr(left)?),
            self.binary_op(op)?,
            Box::new(self.parse_sql_expr(right)?),
        )))
    }

    fn unary_expr(&self, op: &UnaryOperator, expr: &SQLExpr) -> Result<Expr> {
        Ok(match op {
            UnaryOperator::Not => Expr::Not(Box::new(self.parse_sql_expr(expr)?)),
            UnaryOperator::Plus => self.parse_sql_expr(expr)?,
            UnaryOperator::Minus => match expr {
                // Fold the sign into number literals so `-3` stays a literal
                SQLExpr::Value(Value::Number(n, _)) => self.number(&format!("-{n}"))?,
                _ => Expr::Negative(Box::new(self.parse_sql_expr(expr)?)),
            },
            _ => {
                return Err(Error::invalid_input(
                    format!("Unary operator '{:?}' is not supported", op),
                    location!(),
                ))
            }
        })
    }

    // See datafusion `SqlToRel::parse_sql_number()`
    fn number(&self, value: &str) -> Result<Expr> {
        if let Ok(n) = value.parse::<i64>() {
            Ok(lit(n))
        } else {
            value.parse::<f64>().map(lit).map_err(|_| {
                Error::invalid_input(format!("'{value}' is not a number"), location!())
            })
        }
    }

    fn value(&self, value: &Value) -> Result<Expr> {
        Ok(match value {
            Value::Number(v, _) => self.number(v.as_str())?,
            Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
                Expr::Literal(ScalarValue::Utf8(Some(s.clone())))
            }
            Value::Boolean(v) => Expr::Literal(ScalarValue::Boolean(Some(*v))),
            Value::Null => Expr::Literal(ScalarValue::Null),
            _ => {
                return Err(Error::invalid_input(
                    format!("Value '{value}' is not supported"),
                    location!(),
                ))
            }
        })
    }

    fn parse_type(&self, data_type: &SQLDataType) -> Result<ArrowDataType> {
        let time_unit = |resolution: &Option<u64>| match resolution {
            // Microseconds unless asked otherwise
            None | Some(6) => Ok(TimeUnit::Microsecond),
            Some(0) => Ok(TimeUnit::Second),
            Some(3) => Ok(TimeUnit::Millisecond),
            Some(9) => Ok(TimeUnit::Nanosecond),
            Some(other) => Err(Error::invalid_input(
                format!("Unsupported timestamp resolution: {other}"),
                location!(),
            )),
        };
        match data_type {
            SQLDataType::String(_) => Ok(ArrowDataType::Utf8),
            SQLDataType::Boolean => Ok(ArrowDataType::Boolean),
            SQLDataType::TinyInt(_) => Ok(ArrowDataType::Int8),
            SQLDataType::SmallInt(_) => Ok(ArrowDataType::Int16),
            SQLDataType::Int(_) | SQLDataType::Integer(_) => Ok(ArrowDataType::Int32),
            SQLDataType::BigInt(_) => Ok(ArrowDataType::Int64),
            SQLDataType::Float(_) => Ok(ArrowDataType::Float32),
            SQLDataType::Date => Ok(ArrowDataType::Date32),
            SQLDataType::Timestamp(resolution, TimezoneInfo::None) => {
                Ok(ArrowDataType::Timestamp(time_unit(resolution)?, None))
            }
            SQLDataType::Decimal(ExactNumberInfo::PrecisionAndScale(precision, scale)) => Ok(
                ArrowDataType::Decimal128(*precision as u8, *scale as i8),
            ),
            _ => Err(Error::invalid_input(
                format!("Unsupported data type: {data_type}"),
                location!(),
            )),
        }
    }

    fn parse_sql_expr(&self, expr: &SQLExpr) -> Result<Expr> {
        let boxed = |expr: &SQLExpr| self.parse_sql_expr(expr).map(Box::new);
        match expr {
            SQLExpr::Identifier(id) => self.column(std::slice::from_ref(id)),
            SQLExpr::CompoundIdentifier(ids) => self.column(ids.as_slice()),
            SQLExpr::BinaryOp { left, op, right } => self.binary_expr(left, op, right),
            SQLExpr::UnaryOp { op, expr } => self.unary_expr(op, expr),
            SQLExpr::Value(value) => self.value(value),
            SQLExpr::Nested(inner) => self.parse_sql_expr(inner.as_ref()),
            // For example, DATE '2020-01-01'
            SQLExpr::TypedString {
                data_type, value, ..
            } => Ok(Expr::Cast(Cast::new(
                Box::new(lit(value.clone())),
                self.parse_type(data_type)?,
            ))),
            SQLExpr::Cast {
                expr, data_type, ..
            } => Ok(Expr::Cast(Cast::new(boxed(expr)?, self.parse_type(data_type)?))),
            SQLExpr::IsNull(expr) => Ok(Expr::IsNull(boxed(expr)?)),
            SQLExpr::IsNotNull(expr) => Ok(Expr::IsNotNull(boxed(expr)?)),
            SQLExpr::IsTrue(expr) => Ok(Expr::IsTrue(boxed(expr)?)),
            SQLExpr::IsNotTrue(expr) => Ok(Expr::IsNotTrue(boxed(expr)?)),
            SQLExpr::IsFalse(expr) => Ok(Expr::IsFalse(boxed(expr)?)),
            SQLExpr::IsNotFalse(expr) => Ok(Expr::IsNotFalse(boxed(expr)?)),
            SQLExpr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Expr::Between(Between::new(
                boxed(expr)?,
                *negated,
                boxed(low)?,
                boxed(high)?,
            ))),
            SQLExpr::InList {
                expr,
                list,
                negated,
            } => {
                let list = list
                    .iter()
                    .map(|e| self.parse_sql_expr(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(self.parse_sql_expr(expr)?.in_list(list, *negated))
            }
            SQLExpr::Like {
                negated,
                expr,
                pattern,
                escape_char: None,
                ..
            } => Ok(Expr::Like(Like::new(
                *negated,
                boxed(expr)?,
                boxed(pattern)?,
                None,
                false,
            ))),
            SQLExpr::ILike {
                negated,
                expr,
                pattern,
                escape_char: None,
                ..
            } => Ok(Expr::Like(Like::new(
                *negated,
                boxed(expr)?,
                boxed(pattern)?,
                None,
                true,
            ))),
            _ => Err(Error::invalid_input(
                format!("Expression '{expr}' is not supported"),
                location!(),
            )),
        }
    }

    /// Create a logical [`Expr`] from a SQL `WHERE` clause.
    ///
    /// The clause must produce booleans. A bare `NULL` is read as a boolean
    /// that is never true.
    pub fn parse_filter(&self, filter: &str) -> Result<Expr> {
        let ast_expr = parse_sql_filter(filter)?;
        let expr = self.parse_sql_expr(&ast_expr)?;
        let df_schema = self.df_schema()?;
        match self.coerce(expr.clone(), &df_schema)?.get_type(&df_schema)? {
            ArrowDataType::Boolean => Ok(expr),
            ArrowDataType::Null => Ok(Expr::Cast(Cast::new(
                Box::new(expr),
                ArrowDataType::Boolean,
            ))),
            other => Err(Error::invalid_input(
                format!("Filter '{filter}' must be a boolean expression, found {other}"),
                location!(),
            )),
        }
    }

    /// Create a logical [`Expr`] from a single SQL expression, such as a
    /// projected column.
    pub fn parse_expr(&self, expr: &str) -> Result<Expr> {
        let ast_expr = parse_sql_expr(expr)?;
        let expr = self.parse_sql_expr(&ast_expr)?;
        // Type check only, the expression is kept as written
        self.coerce(expr.clone(), &self.df_schema()?)?;
        Ok(expr)
    }

    fn coerce(&self, expr: Expr, df_schema: &DFSchema) -> Result<Expr> {
        let props = ExecutionProps::default();
        let context = SimplifyContext::new(&props).with_schema(Arc::new(df_schema.clone()));
        Ok(ExprSimplifier::new(context).coerce(expr, df_schema)?)
    }

    /// Coerce the operand types of `expr` and fold its constant parts.
    pub fn optimize_expr(&self, expr: Expr) -> Result<Expr> {
        let df_schema = Arc::new(self.df_schema()?);

        // Types must line up before the physical planner accepts an expression
        let props = ExecutionProps::default();
        let simplify_context = SimplifyContext::new(&props).with_schema(df_schema.clone());
        let simplifier = ExprSimplifier::new(simplify_context);
        let expr = simplifier.coerce(expr, &df_schema)?;
        Ok(simplifier.simplify(expr)?)
    }

    /// Create the [`PhysicalExpr`] from an optimized logical [`Expr`].
    ///
    /// Columns are bound by position in this planner's schema, so batches
    /// passed to the result must have that schema.
    pub fn create_physical_expr(&self, expr: &Expr) -> Result<Arc<dyn PhysicalExpr>> {
        Ok(datafusion::physical_expr::create_physical_expr(
            expr,
            &self.df_schema()?,
            &ExecutionProps::default(),
        )?)
    }

    /// The output field named `name` for an optimized expression.
    pub fn output_field(&self, name: &str, expr: &Expr) -> Result<Field> {
        let df_schema = self.df_schema()?;
        Ok(Field::new(
            name,
            expr.get_type(&df_schema)?,
            expr.nullable(&df_schema)?,
        ))
    }

    /// The top level columns `expr` reads, sorted by name.
    pub fn column_names_in_expr(expr: &Expr) -> Vec<String> {
        expr.column_refs()
            .into_iter()
            .map(|column| column.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Evaluate a filter over `batch`. Null results never select a row.
pub fn evaluate_predicate(
    predicate: &dyn PhysicalExpr,
    batch: &RecordBatch,
) -> Result<BooleanArray> {
    let result = predicate.evaluate(batch)?.into_array(batch.num_rows())?;
    let Some(selection) = result.as_boolean_opt() else {
        return Err(Error::internal(
            format!("Filter produced {} instead of booleans", result.data_type()),
            location!(),
        ));
    };
    Ok(match selection.nulls() {
        Some(nulls) if nulls.null_count() > 0 => {
            BooleanArray::new(selection.values() & nulls.inner(), None)
        }
        _ => selection.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_array::{ArrayRef, Float32Array, Int32Array, Int64Array, StringArray, StructArray};
    use arrow_schema::{Fields, Schema as ArrowSchema};
    use datafusion::logical_expr::col;

    use super::*;

    fn schema() -> SchemaRef {
        Arc::new(ArrowSchema::new(vec![
            Field::new("i", ArrowDataType::Int32, false),
            Field::new("s", ArrowDataType::Utf8, true),
            Field::new(
                "st",
                ArrowDataType::Struct(Fields::from(vec![
                    Field::new("x", ArrowDataType::Float32, true),
                    Field::new("y", ArrowDataType::Float32, false),
                ])),
                true,
            ),
        ]))
    }

    fn batch() -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from_iter_values(0..6)),
                Arc::new(StringArray::from(vec![
                    Some("s-0"),
                    None,
                    Some("s-2"),
                    Some("s-3"),
                    None,
                    Some("s-5"),
                ])),
                Arc::new(StructArray::from(vec![
                    (
                        Arc::new(Field::new("x", ArrowDataType::Float32, true)),
                        Arc::new(Float32Array::from(vec![
                            Some(0.0),
                            Some(1.0),
                            None,
                            Some(3.0),
                            Some(4.0),
                            Some(5.0),
                        ])) as ArrayRef,
                    ),
                    (
                        Arc::new(Field::new("y", ArrowDataType::Float32, false)),
                        Arc::new(Float32Array::from_iter_values((0..6).map(|v| v as f32 * 10.0))),
                    ),
                ])),
            ],
        )
        .unwrap()
    }

    fn selection(planner: &Planner, filter: &str) -> Vec<bool> {
        let expr = planner.parse_filter(filter).unwrap();
        let expr = planner.optimize_expr(expr).unwrap();
        let physical = planner.create_physical_expr(&expr).unwrap();
        let selection = evaluate_predicate(physical.as_ref(), &batch()).unwrap();
        assert_eq!(selection.null_count(), 0);
        selection.iter().map(|v| v.unwrap()).collect()
    }

    #[test]
    fn test_parse_filter_simple() {
        let planner = Planner::new(schema());

        let expected = col("i")
            .gt(lit(3_i64))
            .and(get_field(col("st"), "x").lt_eq(lit(5.0_f64)))
            .and(
                col("s")
                    .eq(lit("s-4"))
                    .or(col("s").in_list(vec![lit("s-4"), lit("s-5")], false)),
            );
        for filter in [
            "i > 3 AND st.x <= 5.0 AND (s == 's-4' OR s in ('s-4', 's-5'))",
            "i > 3 AND `st`.`x` <= 5.0 AND (s = 's-4' OR s IN ('s-4', 's-5'))",
        ] {
            assert_eq!(planner.parse_filter(filter).unwrap(), expected, "{filter}");
        }
        assert_eq!(
            Planner::column_names_in_expr(&expected),
            vec!["i".to_string(), "s".to_string(), "st".to_string()]
        );
    }

    #[test]
    fn test_evaluate_filter() {
        let planner = Planner::new(schema());
        let cases = [
            ("i >= 2", vec![false, false, true, true, true, true]),
            ("i == 2", vec![false, false, true, false, false, false]),
            ("i BETWEEN 2 AND 3", vec![false, false, true, true, false, false]),
            ("i NOT IN (1, 3)", vec![true, false, true, false, true, true]),
            ("s IS NULL", vec![false, true, false, false, true, false]),
            ("s LIKE '%-3'", vec![false, false, false, true, false, false]),
            ("(i + 1) * 2 > 7", vec![false, false, false, true, true, true]),
            ("-i < -3", vec![false, false, false, false, true, true]),
            ("i % 2 = 1 OR s = 's-0'", vec![true, true, false, true, false, true]),
            // Null comparisons select nothing
            ("st.x >= 1.5", vec![false, false, false, true, true, true]),
            ("st.y = 20", vec![false, false, true, false, false, false]),
            ("NOT (s = 's-2')", vec![true, false, false, true, false, true]),
            ("true", vec![true; 6]),
            ("false", vec![false; 6]),
            ("NULL", vec![false; 6]),
        ];
        for (filter, expected) in cases {
            assert_eq!(selection(&planner, filter), expected, "{filter}");
        }
    }

    #[test]
    fn test_negative_expressions() {
        let schema = Arc::new(ArrowSchema::new(vec![Field::new(
            "x",
            ArrowDataType::Int64,
            false,
        )]));
        let planner = Planner::new(schema.clone());

        let expected = col("x")
            .gt(lit(-3_i64))
            .and(col("x").lt(-(lit(-5_i64) + lit(3_i64))));
        let expr = planner.parse_filter("x > -3 AND x < -(-5 + 3)").unwrap();
        assert_eq!(expr, expected);

        let expr = planner.optimize_expr(expr).unwrap();
        let physical = planner.create_physical_expr(&expr).unwrap();
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from_iter_values(-5..5)) as ArrayRef],
        )
        .unwrap();
        assert_eq!(
            evaluate_predicate(physical.as_ref(), &batch).unwrap(),
            BooleanArray::from(vec![
                false, false, false, true, true, true, true, false, false, false
            ])
        );
    }

    #[test]
    fn test_constant_filters_fold() {
        let planner = Planner::new(schema());
        for (filter, expected) in [
            ("i > 3 AND false", ScalarValue::Boolean(Some(false))),
            ("1 = 1", ScalarValue::Boolean(Some(true))),
            ("NULL", ScalarValue::Boolean(None)),
        ] {
            let expr = planner.parse_filter(filter).unwrap();
            assert_eq!(
                planner.optimize_expr(expr).unwrap(),
                Expr::Literal(expected),
                "{filter}"
            );
        }
    }

    #[test]
    fn test_invalid_filters() {
        let planner = Planner::new(schema());
        for filter in ["i", "s", "missing > 1", "st.z = 1", "i.x = 1", "i >", "", "i <=> 1"] {
            assert!(
                matches!(planner.parse_filter(filter), Err(Error::InvalidInput { .. })),
                "{}",
                filter
            );
        }
    }

    #[test]
    fn test_sql_cast() {
        let cases = [
            ("x = cast('2021-01-01' as date)", ArrowDataType::Date32),
            (
                "x = cast('2021-01-01 00:00:00' as timestamp)",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
            ),
            (
                "x = timestamp(9) '2021-01-01 00:00:00.123'",
                ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
            ),
            ("x = cast(1 as bigint)", ArrowDataType::Int64),
            ("x = cast(1 as float)", ArrowDataType::Float32),
            ("x = cast('1.238' as decimal(9,3))", ArrowDataType::Decimal128(9, 3)),
        ];
        for (sql, expected_type) in cases {
            let schema = Arc::new(ArrowSchema::new(vec![Field::new(
                "x",
                expected_type.clone(),
                true,
            )]));
            let planner = Planner::new(schema);
            match planner.parse_filter(sql).unwrap() {
                Expr::BinaryExpr(BinaryExpr { right, .. }) => match right.as_ref() {
                    Expr::Cast(Cast { data_type, .. }) => assert_eq!(data_type, &expected_type),
                    other => panic!("Expected a cast on the right of {sql}, got {other}"),
                },
                other => panic!("Expected a binary expression for {sql}, got {other}"),
            }
        }
    }

    #[test]
    fn test_parse_expr() {
        let planner = Planner::new(schema());
        let batch = batch();

        let expr = planner.parse_expr("i * 2").unwrap();
        let expr = planner.optimize_expr(expr).unwrap();
        let field = planner.output_field("twice", &expr).unwrap();
        assert_eq!(field.data_type(), &ArrowDataType::Int64);
        assert!(!field.is_nullable());

        let result = planner
            .create_physical_expr(&expr)
            .unwrap()
            .evaluate(&batch)
            .unwrap()
            .into_array(batch.num_rows())
            .unwrap();
        assert_eq!(
            result.as_primitive::<arrow_array::types::Int64Type>().values().to_vec(),
            vec![0, 2, 4, 6, 8, 10]
        );

        let nested = planner.parse_expr("st.y").unwrap();
        assert_eq!(nested, get_field(col("st"), "y"));
        assert_eq!(planner.parse_expr("s").unwrap(), col("s"));
        assert!(planner.parse_expr("nope").is_err());
        assert!(planner.parse_expr("i + 1, s").is_err());
    }
}
