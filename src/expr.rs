// Copyright 2024-2026 chronicle-store contributors.
// This file is part of chronicle-store.

// chronicle-store is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// chronicle-store is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with chronicle-store.  If not, see <http://www.gnu.org/licenses/>.

//! Expression trees for guards, computeds and query push-down.
//!
//! Each node compiles to three targets:
//! - `eval(ctx)`   -> a [`Value`], evaluated natively
//! - `to_sql(col)` -> a PostgreSQL predicate fragment over one JSONB column
//! - `to_pure(var)` -> a Legend Pure expression string
//!
//! Trees are built by composing literals and fields with `std::ops`
//! overloads and fluent methods; nothing is computed at definition time.
//! The serialized `{"type": ..}` form round-trips losslessly.

use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt;
use std::ops;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value an expression can produce: null, boolean, 64-bit integer,
/// 64-bit float, string, or a list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	Str(String),
	List(Vec<Value>),
}

impl Value {
	pub fn is_null(&self) -> bool {
		matches!(self, Value::Null)
	}

	/// Truthiness: null, zero, the empty string and the empty list are
	/// falsy; everything else is truthy.
	pub fn truthy(&self) -> bool {
		match self {
			Value::Null => false,
			Value::Bool(b) => *b,
			Value::Int(i) => *i != 0,
			Value::Float(f) => *f != 0.0,
			Value::Str(s) => !s.is_empty(),
			Value::List(l) => !l.is_empty(),
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Int(i) => Some(*i as f64),
			Value::Float(f) => Some(*f),
			_ => None,
		}
	}

	fn type_name(&self) -> &'static str {
		match self {
			Value::Null => "null",
			Value::Bool(_) => "boolean",
			Value::Int(_) => "integer",
			Value::Float(_) => "float",
			Value::Str(_) => "string",
			Value::List(_) => "list",
		}
	}
}

impl From<bool> for Value {
	fn from(b: bool) -> Self {
		Value::Bool(b)
	}
}

impl From<i64> for Value {
	fn from(i: i64) -> Self {
		Value::Int(i)
	}
}

impl From<i32> for Value {
	fn from(i: i32) -> Self {
		Value::Int(i as i64)
	}
}

impl From<f64> for Value {
	fn from(f: f64) -> Self {
		Value::Float(f)
	}
}

impl From<&str> for Value {
	fn from(s: &str) -> Self {
		Value::Str(s.to_string())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Value::Str(s)
	}
}

impl From<Vec<Value>> for Value {
	fn from(l: Vec<Value>) -> Self {
		Value::List(l)
	}
}

/// Failures of native evaluation. Arithmetic on nulls does not fail (it
/// yields null); these are the genuinely erroneous cases.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
	#[error("division by zero")]
	DivisionByZero,
	#[error("integer overflow in '{0}'")]
	Overflow(&'static str),
	#[error("domain error: {0}({1}) is undefined")]
	Domain(&'static str, f64),
	#[error("type error: '{op}' expects {expected}, got {found}")]
	Type { op: &'static str, expected: &'static str, found: &'static str },
	#[error("'{0}' expects {1} argument(s)")]
	Arity(&'static str, &'static str),
}

/// Evaluation context: a mapping from field name to value. A missing
/// field evaluates to null, which is falsy in guards.
pub trait Context {
	fn get(&self, field: &str) -> Option<Value>;
}

impl Context for std::collections::HashMap<String, Value> {
	fn get(&self, field: &str) -> Option<Value> {
		self.get(field).cloned()
	}
}

impl Context for std::collections::BTreeMap<String, Value> {
	fn get(&self, field: &str) -> Option<Value> {
		self.get(field).cloned()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
	#[serde(rename = "+")]
	Add,
	#[serde(rename = "-")]
	Sub,
	#[serde(rename = "*")]
	Mul,
	#[serde(rename = "/")]
	Div,
	#[serde(rename = "%")]
	Rem,
	#[serde(rename = "**")]
	Pow,
	#[serde(rename = ">")]
	Gt,
	#[serde(rename = "<")]
	Lt,
	#[serde(rename = ">=")]
	Ge,
	#[serde(rename = "<=")]
	Le,
	#[serde(rename = "==")]
	Eq,
	#[serde(rename = "!=")]
	Ne,
	#[serde(rename = "and")]
	And,
	#[serde(rename = "or")]
	Or,
}

impl BinaryOp {
	fn is_numeric(&self) -> bool {
		matches!(
			self,
			BinaryOp::Add
				| BinaryOp::Sub | BinaryOp::Mul
				| BinaryOp::Div | BinaryOp::Rem
				| BinaryOp::Pow | BinaryOp::Gt
				| BinaryOp::Lt | BinaryOp::Ge
				| BinaryOp::Le
		)
	}

	fn sql_token(&self) -> &'static str {
		match self {
			BinaryOp::Add => "+",
			BinaryOp::Sub => "-",
			BinaryOp::Mul => "*",
			BinaryOp::Div => "/",
			BinaryOp::Rem => "%",
			BinaryOp::Pow => "^",
			BinaryOp::Gt => ">",
			BinaryOp::Lt => "<",
			BinaryOp::Ge => ">=",
			BinaryOp::Le => "<=",
			BinaryOp::Eq => "=",
			BinaryOp::Ne => "!=",
			BinaryOp::And => "AND",
			BinaryOp::Or => "OR",
		}
	}

	fn pure_token(&self) -> &'static str {
		match self {
			BinaryOp::Add => "+",
			BinaryOp::Sub => "-",
			BinaryOp::Mul => "*",
			BinaryOp::Div => "/",
			BinaryOp::Rem => "%",
			BinaryOp::Pow => "^",
			BinaryOp::Gt => ">",
			BinaryOp::Lt => "<",
			BinaryOp::Ge => ">=",
			BinaryOp::Le => "<=",
			BinaryOp::Eq => "==",
			BinaryOp::Ne => "!=",
			BinaryOp::And => "&&",
			BinaryOp::Or => "||",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
	Neg,
	Abs,
	Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuncName {
	Sqrt,
	Ceil,
	Floor,
	Round,
	Log,
	Exp,
	Min,
	Max,
}

impl FuncName {
	fn as_str(&self) -> &'static str {
		match self {
			FuncName::Sqrt => "sqrt",
			FuncName::Ceil => "ceil",
			FuncName::Floor => "floor",
			FuncName::Round => "round",
			FuncName::Log => "log",
			FuncName::Exp => "exp",
			FuncName::Min => "min",
			FuncName::Max => "max",
		}
	}

	fn sql_name(&self) -> &'static str {
		match self {
			FuncName::Sqrt => "SQRT",
			FuncName::Ceil => "CEIL",
			FuncName::Floor => "FLOOR",
			FuncName::Round => "ROUND",
			FuncName::Log => "LN",
			FuncName::Exp => "EXP",
			FuncName::Min => "LEAST",
			FuncName::Max => "GREATEST",
		}
	}

	fn pure_name(&self) -> &'static str {
		match self {
			FuncName::Sqrt => "sqrt",
			FuncName::Ceil => "ceiling",
			FuncName::Floor => "floor",
			FuncName::Round => "round",
			FuncName::Log => "log",
			FuncName::Exp => "exp",
			FuncName::Min => "min",
			FuncName::Max => "max",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrFn {
	Length,
	Upper,
	Lower,
	Contains,
	StartsWith,
	Concat,
}

impl StrFn {
	fn as_str(&self) -> &'static str {
		match self {
			StrFn::Length => "length",
			StrFn::Upper => "upper",
			StrFn::Lower => "lower",
			StrFn::Contains => "contains",
			StrFn::StartsWith => "starts_with",
			StrFn::Concat => "concat",
		}
	}

	fn takes_arg(&self) -> bool {
		matches!(self, StrFn::Contains | StrFn::StartsWith | StrFn::Concat)
	}
}

/// An expression tree node. The serialized form is the contract:
/// `{"type": "BinOp", "op": "+", "left": .., "right": ..}` and so on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
	Const {
		value: Value,
	},
	Field {
		name: String,
	},
	BinOp {
		op: BinaryOp,
		left: Box<Expr>,
		right: Box<Expr>,
	},
	UnaryOp {
		op: UnaryOp,
		operand: Box<Expr>,
	},
	Func {
		name: FuncName,
		args: Vec<Expr>,
	},
	If {
		condition: Box<Expr>,
		then: Box<Expr>,
		#[serde(rename = "else")]
		otherwise: Box<Expr>,
	},
	Coalesce {
		exprs: Vec<Expr>,
	},
	IsNull {
		operand: Box<Expr>,
	},
	StrOp {
		op: StrFn,
		operand: Box<Expr>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		arg: Option<Box<Expr>>,
	},
}

impl From<Value> for Expr {
	fn from(value: Value) -> Self {
		Expr::Const { value }
	}
}

impl From<bool> for Expr {
	fn from(v: bool) -> Self {
		Expr::lit(v)
	}
}

impl From<i64> for Expr {
	fn from(v: i64) -> Self {
		Expr::lit(v)
	}
}

impl From<i32> for Expr {
	fn from(v: i32) -> Self {
		Expr::lit(v)
	}
}

impl From<f64> for Expr {
	fn from(v: f64) -> Self {
		Expr::lit(v)
	}
}

impl From<&str> for Expr {
	fn from(v: &str) -> Self {
		Expr::lit(v)
	}
}

impl From<String> for Expr {
	fn from(v: String) -> Self {
		Expr::lit(v)
	}
}

// ── Builders ─────────────────────────────────────────────────────────

impl Expr {
	/// A constant literal.
	pub fn lit(value: impl Into<Value>) -> Expr {
		Expr::Const { value: value.into() }
	}

	/// A reference to a field on the current entity.
	pub fn field(name: impl Into<String>) -> Expr {
		Expr::Field { name: name.into() }
	}

	fn binop(self, op: BinaryOp, rhs: impl Into<Expr>) -> Expr {
		Expr::BinOp { op, left: Box::new(self), right: Box::new(rhs.into()) }
	}

	pub fn pow(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Pow, rhs)
	}

	pub fn gt(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Gt, rhs)
	}

	pub fn lt(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Lt, rhs)
	}

	pub fn ge(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Ge, rhs)
	}

	pub fn le(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Le, rhs)
	}

	pub fn eq(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Eq, rhs)
	}

	pub fn ne(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Ne, rhs)
	}

	pub fn and(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::And, rhs)
	}

	pub fn or(self, rhs: impl Into<Expr>) -> Expr {
		self.binop(BinaryOp::Or, rhs)
	}

	pub fn not(self) -> Expr {
		Expr::UnaryOp { op: UnaryOp::Not, operand: Box::new(self) }
	}

	pub fn abs(self) -> Expr {
		Expr::UnaryOp { op: UnaryOp::Abs, operand: Box::new(self) }
	}

	pub fn func(name: FuncName, args: Vec<Expr>) -> Expr {
		Expr::Func { name, args }
	}

	pub fn sqrt(self) -> Expr {
		Expr::func(FuncName::Sqrt, vec![self])
	}

	pub fn ceil(self) -> Expr {
		Expr::func(FuncName::Ceil, vec![self])
	}

	pub fn floor(self) -> Expr {
		Expr::func(FuncName::Floor, vec![self])
	}

	pub fn round(self) -> Expr {
		Expr::func(FuncName::Round, vec![self])
	}

	pub fn log(self) -> Expr {
		Expr::func(FuncName::Log, vec![self])
	}

	pub fn exp(self) -> Expr {
		Expr::func(FuncName::Exp, vec![self])
	}

	pub fn min(args: Vec<Expr>) -> Expr {
		Expr::func(FuncName::Min, args)
	}

	pub fn max(args: Vec<Expr>) -> Expr {
		Expr::func(FuncName::Max, args)
	}

	pub fn if_else(condition: Expr, then: Expr, otherwise: Expr) -> Expr {
		Expr::If { condition: Box::new(condition), then: Box::new(then), otherwise: Box::new(otherwise) }
	}

	pub fn coalesce(exprs: Vec<Expr>) -> Expr {
		Expr::Coalesce { exprs }
	}

	pub fn is_null(self) -> Expr {
		Expr::IsNull { operand: Box::new(self) }
	}

	fn strop(self, op: StrFn, arg: Option<Expr>) -> Expr {
		Expr::StrOp { op, operand: Box::new(self), arg: arg.map(Box::new) }
	}

	pub fn length(self) -> Expr {
		self.strop(StrFn::Length, None)
	}

	pub fn upper(self) -> Expr {
		self.strop(StrFn::Upper, None)
	}

	pub fn lower(self) -> Expr {
		self.strop(StrFn::Lower, None)
	}

	pub fn contains(self, substring: impl Into<Expr>) -> Expr {
		self.strop(StrFn::Contains, Some(substring.into()))
	}

	pub fn starts_with(self, prefix: impl Into<Expr>) -> Expr {
		self.strop(StrFn::StartsWith, Some(prefix.into()))
	}

	pub fn concat(self, other: impl Into<Expr>) -> Expr {
		self.strop(StrFn::Concat, Some(other.into()))
	}

	/// The names of all fields this expression reads.
	pub fn fields(&self) -> BTreeSet<&str> {
		let mut out = BTreeSet::new();
		self.collect_fields(&mut out);
		out
	}

	fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
		match self {
			Expr::Const { .. } => {}
			Expr::Field { name } => {
				out.insert(name.as_str());
			}
			Expr::BinOp { left, right, .. } => {
				left.collect_fields(out);
				right.collect_fields(out);
			}
			Expr::UnaryOp { operand, .. } => operand.collect_fields(out),
			Expr::Func { args, .. } => {
				for a in args {
					a.collect_fields(out);
				}
			}
			Expr::If { condition, then, otherwise } => {
				condition.collect_fields(out);
				then.collect_fields(out);
				otherwise.collect_fields(out);
			}
			Expr::Coalesce { exprs } => {
				for e in exprs {
					e.collect_fields(out);
				}
			}
			Expr::IsNull { operand } => operand.collect_fields(out),
			Expr::StrOp { operand, arg, .. } => {
				operand.collect_fields(out);
				if let Some(arg) = arg {
					arg.collect_fields(out);
				}
			}
		}
	}
}

impl<R: Into<Expr>> ops::Add<R> for Expr {
	type Output = Expr;

	fn add(self, rhs: R) -> Expr {
		self.binop(BinaryOp::Add, rhs)
	}
}

impl<R: Into<Expr>> ops::Sub<R> for Expr {
	type Output = Expr;

	fn sub(self, rhs: R) -> Expr {
		self.binop(BinaryOp::Sub, rhs)
	}
}

impl<R: Into<Expr>> ops::Mul<R> for Expr {
	type Output = Expr;

	fn mul(self, rhs: R) -> Expr {
		self.binop(BinaryOp::Mul, rhs)
	}
}

impl<R: Into<Expr>> ops::Div<R> for Expr {
	type Output = Expr;

	fn div(self, rhs: R) -> Expr {
		self.binop(BinaryOp::Div, rhs)
	}
}

impl<R: Into<Expr>> ops::Rem<R> for Expr {
	type Output = Expr;

	fn rem(self, rhs: R) -> Expr {
		self.binop(BinaryOp::Rem, rhs)
	}
}

impl ops::Neg for Expr {
	type Output = Expr;

	fn neg(self) -> Expr {
		Expr::UnaryOp { op: UnaryOp::Neg, operand: Box::new(self) }
	}
}

// ── Native evaluation ────────────────────────────────────────────────

impl Expr {
	/// Evaluate against a context. Arithmetic over nulls yields null;
	/// division by zero and domain errors fail; `and`/`or` short-circuit.
	pub fn eval(&self, ctx: &dyn Context) -> Result<Value, ExprError> {
		match self {
			Expr::Const { value } => Ok(value.clone()),
			Expr::Field { name } => Ok(ctx.get(name).unwrap_or(Value::Null)),
			Expr::BinOp { op, left, right } => match op {
				BinaryOp::And => {
					let l = left.eval(ctx)?;
					if !l.truthy() {
						Ok(l)
					} else {
						right.eval(ctx)
					}
				}
				BinaryOp::Or => {
					let l = left.eval(ctx)?;
					if l.truthy() {
						Ok(l)
					} else {
						right.eval(ctx)
					}
				}
				BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le => {
					compare(*op, left.eval(ctx)?, right.eval(ctx)?)
				}
				_ => arith(*op, left.eval(ctx)?, right.eval(ctx)?),
			},
			Expr::UnaryOp { op, operand } => unary(*op, operand.eval(ctx)?),
			Expr::Func { name, args } => {
				let mut evaluated = Vec::with_capacity(args.len());
				for a in args {
					evaluated.push(a.eval(ctx)?);
				}
				apply_func(*name, evaluated)
			}
			Expr::If { condition, then, otherwise } => {
				if condition.eval(ctx)?.truthy() {
					then.eval(ctx)
				} else {
					otherwise.eval(ctx)
				}
			}
			Expr::Coalesce { exprs } => {
				for e in exprs {
					let v = e.eval(ctx)?;
					if !v.is_null() {
						return Ok(v);
					}
				}
				Ok(Value::Null)
			}
			Expr::IsNull { operand } => Ok(Value::Bool(operand.eval(ctx)?.is_null())),
			Expr::StrOp { op, operand, arg } => {
				let v = operand.eval(ctx)?;
				let arg = match arg {
					Some(a) => Some(a.eval(ctx)?),
					None if op.takes_arg() => return Err(ExprError::Arity(op.as_str(), "2")),
					None => None,
				};
				apply_strop(*op, v, arg)
			}
		}
	}
}

fn arith(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExprError> {
	if l.is_null() || r.is_null() {
		return Ok(Value::Null);
	}
	match (&l, &r) {
		(Value::Int(a), Value::Int(b)) => int_arith(op, *a, *b),
		_ => {
			let a = l.as_f64().ok_or(ExprError::Type {
				op: op.sql_token(),
				expected: "numeric operands",
				found: l.type_name(),
			})?;
			let b = r.as_f64().ok_or(ExprError::Type {
				op: op.sql_token(),
				expected: "numeric operands",
				found: r.type_name(),
			})?;
			float_arith(op, a, b)
		}
	}
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Value, ExprError> {
	match op {
		BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or(ExprError::Overflow("+")),
		BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or(ExprError::Overflow("-")),
		BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or(ExprError::Overflow("*")),
		// True division: integer operands still divide into a float.
		BinaryOp::Div => {
			if b == 0 {
				Err(ExprError::DivisionByZero)
			} else {
				Ok(Value::Float(a as f64 / b as f64))
			}
		}
		BinaryOp::Rem => {
			if b == 0 {
				Err(ExprError::DivisionByZero)
			} else {
				// Floor-mod: the result takes the sign of the divisor.
				// i64::MIN % -1 has remainder 0.
				let r = a.checked_rem(b).unwrap_or(0);
				if r != 0 && (r < 0) != (b < 0) {
					Ok(Value::Int(r + b))
				} else {
					Ok(Value::Int(r))
				}
			}
		}
		BinaryOp::Pow => {
			if b >= 0 {
				let exp = u32::try_from(b).map_err(|_| ExprError::Overflow("**"))?;
				a.checked_pow(exp).map(Value::Int).ok_or(ExprError::Overflow("**"))
			} else {
				Ok(Value::Float((a as f64).powf(b as f64)))
			}
		}
		_ => unreachable!("non-arithmetic op in int_arith"),
	}
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Result<Value, ExprError> {
	match op {
		BinaryOp::Add => Ok(Value::Float(a + b)),
		BinaryOp::Sub => Ok(Value::Float(a - b)),
		BinaryOp::Mul => Ok(Value::Float(a * b)),
		BinaryOp::Div => {
			if b == 0.0 {
				Err(ExprError::DivisionByZero)
			} else {
				Ok(Value::Float(a / b))
			}
		}
		BinaryOp::Rem => {
			if b == 0.0 {
				Err(ExprError::DivisionByZero)
			} else {
				// Floor-mod: the result takes the sign of the divisor.
				let r = a % b;
				if r != 0.0 && (r < 0.0) != (b < 0.0) {
					Ok(Value::Float(r + b))
				} else {
					Ok(Value::Float(r))
				}
			}
		}
		BinaryOp::Pow => Ok(Value::Float(a.powf(b))),
		_ => unreachable!("non-arithmetic op in float_arith"),
	}
}

// Comparisons propagate null, SQL-style: a guard over an unknown field is
// falsy rather than an error.
fn compare(op: BinaryOp, l: Value, r: Value) -> Result<Value, ExprError> {
	if l.is_null() || r.is_null() {
		return Ok(Value::Null);
	}
	match op {
		BinaryOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
		BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
		_ => {
			let ordering = match (&l, &r) {
				(Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
				_ => {
					let a = l.as_f64().ok_or(ExprError::Type {
						op: op.sql_token(),
						expected: "comparable operands",
						found: l.type_name(),
					})?;
					let b = r.as_f64().ok_or(ExprError::Type {
						op: op.sql_token(),
						expected: "comparable operands",
						found: r.type_name(),
					})?;
					a.partial_cmp(&b)
				}
			};
			let ordering = match ordering {
				Some(o) => o,
				// NaN comparisons are unknowable, like null.
				None => return Ok(Value::Null),
			};
			let result = match op {
				BinaryOp::Gt => ordering.is_gt(),
				BinaryOp::Lt => ordering.is_lt(),
				BinaryOp::Ge => ordering.is_ge(),
				BinaryOp::Le => ordering.is_le(),
				_ => unreachable!("non-ordering op"),
			};
			Ok(Value::Bool(result))
		}
	}
}

fn loose_eq(l: &Value, r: &Value) -> bool {
	match (l, r) {
		(Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
		_ => l == r,
	}
}

fn unary(op: UnaryOp, v: Value) -> Result<Value, ExprError> {
	match op {
		UnaryOp::Not => Ok(Value::Bool(!v.truthy())),
		UnaryOp::Neg => match v {
			Value::Null => Ok(Value::Null),
			Value::Int(i) => i.checked_neg().map(Value::Int).ok_or(ExprError::Overflow("neg")),
			Value::Float(f) => Ok(Value::Float(-f)),
			other => {
				Err(ExprError::Type { op: "neg", expected: "numeric operand", found: other.type_name() })
			}
		},
		UnaryOp::Abs => match v {
			Value::Null => Ok(Value::Null),
			Value::Int(i) => i.checked_abs().map(Value::Int).ok_or(ExprError::Overflow("abs")),
			Value::Float(f) => Ok(Value::Float(f.abs())),
			other => {
				Err(ExprError::Type { op: "abs", expected: "numeric operand", found: other.type_name() })
			}
		},
	}
}

fn apply_func(name: FuncName, args: Vec<Value>) -> Result<Value, ExprError> {
	let single = matches!(
		name,
		FuncName::Sqrt | FuncName::Ceil | FuncName::Floor | FuncName::Round | FuncName::Log | FuncName::Exp
	);
	if single && args.len() != 1 {
		return Err(ExprError::Arity(name.as_str(), "1"));
	}
	if !single && args.is_empty() {
		return Err(ExprError::Arity(name.as_str(), "at least 1"));
	}
	if args.iter().any(Value::is_null) {
		return Ok(Value::Null);
	}

	let numeric = |v: &Value| -> Result<f64, ExprError> {
		v.as_f64().ok_or(ExprError::Type {
			op: name.as_str(),
			expected: "numeric argument",
			found: v.type_name(),
		})
	};

	match name {
		FuncName::Sqrt => {
			let x = numeric(&args[0])?;
			if x < 0.0 {
				Err(ExprError::Domain("sqrt", x))
			} else {
				Ok(Value::Float(x.sqrt()))
			}
		}
		FuncName::Ceil => Ok(Value::Int(numeric(&args[0])?.ceil() as i64)),
		FuncName::Floor => Ok(Value::Int(numeric(&args[0])?.floor() as i64)),
		FuncName::Round => Ok(Value::Int(numeric(&args[0])?.round() as i64)),
		FuncName::Log => {
			let x = numeric(&args[0])?;
			if x <= 0.0 {
				Err(ExprError::Domain("log", x))
			} else {
				Ok(Value::Float(x.ln()))
			}
		}
		FuncName::Exp => Ok(Value::Float(numeric(&args[0])?.exp())),
		FuncName::Min | FuncName::Max => {
			let all_int = args.iter().all(|v| matches!(v, Value::Int(_)));
			let mut best = numeric(&args[0])?;
			for v in &args[1..] {
				let x = numeric(v)?;
				best = if name == FuncName::Min { best.min(x) } else { best.max(x) };
			}
			if all_int {
				Ok(Value::Int(best as i64))
			} else {
				Ok(Value::Float(best))
			}
		}
	}
}

fn apply_strop(op: StrFn, operand: Value, arg: Option<Value>) -> Result<Value, ExprError> {
	if operand.is_null() || arg.as_ref().map_or(false, Value::is_null) {
		return Ok(Value::Null);
	}
	let s = match &operand {
		Value::Str(s) => s,
		other => {
			return Err(ExprError::Type {
				op: op.as_str(),
				expected: "string operand",
				found: other.type_name(),
			})
		}
	};
	let arg_str = |arg: &Option<Value>| -> Result<String, ExprError> {
		match arg {
			Some(Value::Str(a)) => Ok(a.clone()),
			Some(Value::Int(i)) => Ok(i.to_string()),
			Some(Value::Float(f)) => Ok(f.to_string()),
			Some(Value::Bool(b)) => Ok(b.to_string()),
			Some(other) => Err(ExprError::Type {
				op: op.as_str(),
				expected: "scalar argument",
				found: other.type_name(),
			}),
			None => Err(ExprError::Arity(op.as_str(), "2")),
		}
	};
	match op {
		StrFn::Length => Ok(Value::Int(s.chars().count() as i64)),
		StrFn::Upper => Ok(Value::Str(s.to_uppercase())),
		StrFn::Lower => Ok(Value::Str(s.to_lowercase())),
		StrFn::Contains => Ok(Value::Bool(s.contains(&arg_str(&arg)?))),
		StrFn::StartsWith => Ok(Value::Bool(s.starts_with(&arg_str(&arg)?))),
		StrFn::Concat => Ok(Value::Str(format!("{}{}", s, arg_str(&arg)?))),
	}
}

// ── SQL compilation ──────────────────────────────────────────────────

impl Expr {
	/// Compile to a PostgreSQL predicate fragment over the JSONB column
	/// `col`. Field extractions are text (`->>`); numeric contexts insert
	/// a `::float` cast around them.
	pub fn to_sql(&self, col: &str) -> String {
		match self {
			Expr::Const { value } => sql_const(value),
			Expr::Field { name } => format!("({}->>'{}')", col, sql_escape(name)),
			Expr::BinOp { op, left, right } => {
				let (l, r) = if *op == BinaryOp::Rem {
					(cast_rem_sql(left, col), cast_rem_sql(right, col))
				} else if op.is_numeric() {
					(cast_numeric_sql(left, col), cast_numeric_sql(right, col))
				} else {
					(left.to_sql(col), right.to_sql(col))
				};
				format!("({} {} {})", l, op.sql_token(), r)
			}
			Expr::UnaryOp { op, operand } => match op {
				UnaryOp::Neg => format!("(-{})", cast_numeric_sql(operand, col)),
				UnaryOp::Abs => format!("ABS({})", cast_numeric_sql(operand, col)),
				UnaryOp::Not => format!("NOT ({})", operand.to_sql(col)),
			},
			Expr::Func { name, args } => {
				let args = args.iter().map(|a| cast_numeric_sql(a, col)).join(", ");
				format!("{}({})", name.sql_name(), args)
			}
			Expr::If { condition, then, otherwise } => format!(
				"CASE WHEN {} THEN {} ELSE {} END",
				condition.to_sql(col),
				then.to_sql(col),
				otherwise.to_sql(col)
			),
			Expr::Coalesce { exprs } => {
				let parts = exprs.iter().map(|e| e.to_sql(col)).join(", ");
				format!("COALESCE({})", parts)
			}
			Expr::IsNull { operand } => format!("({} IS NULL)", operand.to_sql(col)),
			Expr::StrOp { op, operand, arg } => {
				let s = operand.to_sql(col);
				let arg = arg.as_ref().map(|a| a.to_sql(col));
				match (op, arg) {
					(StrFn::Length, _) => format!("LENGTH({})", s),
					(StrFn::Upper, _) => format!("UPPER({})", s),
					(StrFn::Lower, _) => format!("LOWER({})", s),
					(StrFn::Contains, Some(a)) => format!("({} LIKE '%' || {} || '%')", s, a),
					(StrFn::StartsWith, Some(a)) => format!("({} LIKE {} || '%')", s, a),
					(StrFn::Concat, Some(a)) => format!("({} || {})", s, a),
					// An argument-less binary string op cannot run; render
					// an always-null fragment rather than panic.
					(_, None) => "NULL".to_string(),
				}
			}
		}
	}
}

fn sql_const(value: &Value) -> String {
	match value {
		Value::Null => "NULL".to_string(),
		Value::Bool(true) => "TRUE".to_string(),
		Value::Bool(false) => "FALSE".to_string(),
		Value::Int(i) => i.to_string(),
		Value::Float(f) => f.to_string(),
		Value::Str(s) => format!("'{}'", sql_escape(s)),
		Value::List(items) => {
			let parts = items.iter().map(sql_const).collect::<Vec<_>>().join(", ");
			format!("ARRAY[{}]", parts)
		}
	}
}

fn sql_escape(s: &str) -> String {
	s.replace('\'', "''")
}

// Numeric fields from JSONB extract as text; cast them for arithmetic.
fn cast_numeric_sql(expr: &Expr, col: &str) -> String {
	if let Expr::Field { name } = expr {
		format!("({}->>'{}')::float", col, sql_escape(name))
	} else {
		expr.to_sql(col)
	}
}

// Postgres defines % over numeric but not double precision, so modulo
// operands get a numeric cast instead of the float one.
fn cast_rem_sql(expr: &Expr, col: &str) -> String {
	if let Expr::Field { name } = expr {
		format!("({}->>'{}')::numeric", col, sql_escape(name))
	} else {
		format!("({})::numeric", expr.to_sql(col))
	}
}

// ── Legend Pure compilation ──────────────────────────────────────────

impl Expr {
	/// Compile to a Legend Pure expression fragment, with `var` naming
	/// the row variable (conventionally `$row`).
	pub fn to_pure(&self, var: &str) -> String {
		match self {
			Expr::Const { value } => pure_const(value),
			Expr::Field { name } => format!("{}.{}", var, name),
			Expr::BinOp { op, left, right } => {
				format!("({} {} {})", left.to_pure(var), op.pure_token(), right.to_pure(var))
			}
			Expr::UnaryOp { op, operand } => match op {
				UnaryOp::Neg => format!("(-{})", operand.to_pure(var)),
				UnaryOp::Abs => format!("abs({})", operand.to_pure(var)),
				UnaryOp::Not => format!("!({})", operand.to_pure(var)),
			},
			Expr::Func { name, args } => {
				let args = args.iter().map(|a| a.to_pure(var)).join(", ");
				format!("{}({})", name.pure_name(), args)
			}
			Expr::If { condition, then, otherwise } => format!(
				"if({}, |{}, |{})",
				condition.to_pure(var),
				then.to_pure(var),
				otherwise.to_pure(var)
			),
			Expr::Coalesce { exprs } => pure_coalesce(exprs, var),
			Expr::IsNull { operand } => format!("isEmpty({})", operand.to_pure(var)),
			Expr::StrOp { op, operand, arg } => {
				let p = operand.to_pure(var);
				let arg = arg.as_ref().map(|a| a.to_pure(var));
				match (op, arg) {
					(StrFn::Length, _) => format!("length({})", p),
					(StrFn::Upper, _) => format!("toUpper({})", p),
					(StrFn::Lower, _) => format!("toLower({})", p),
					(StrFn::Contains, Some(a)) => format!("contains({}, {})", p, a),
					(StrFn::StartsWith, Some(a)) => format!("startsWith({}, {})", p, a),
					(StrFn::Concat, Some(a)) => format!("({} + {})", p, a),
					(_, None) => "[]".to_string(),
				}
			}
		}
	}
}

fn pure_const(value: &Value) -> String {
	match value {
		Value::Null => "[]".to_string(),
		Value::Bool(true) => "true".to_string(),
		Value::Bool(false) => "false".to_string(),
		Value::Int(i) => i.to_string(),
		Value::Float(f) => f.to_string(),
		Value::Str(s) => format!("'{}'", s.replace('\'', "\\'")),
		Value::List(items) => {
			let parts = items.iter().map(pure_const).collect::<Vec<_>>().join(", ");
			format!("[{}]", parts)
		}
	}
}

// Pure has no direct coalesce; chain if/isEmpty.
fn pure_coalesce(exprs: &[Expr], var: &str) -> String {
	match exprs {
		[] => "[]".to_string(),
		[only] => only.to_pure(var),
		[first, rest @ ..] => {
			let first = first.to_pure(var);
			format!("if(isEmpty({}), |{}, |{})", first, pure_coalesce(rest, var), first)
		}
	}
}

impl fmt::Display for Expr {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match serde_json::to_string(self) {
			Ok(json) => f.write_str(&json),
			Err(_) => f.write_str("<expr>"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
	}

	#[test]
	fn arithmetic_composes_through_operators() {
		let market_value = Expr::field("price") * Expr::field("quantity");
		let c = ctx(&[("price", Value::Float(228.0)), ("quantity", Value::Int(100))]);
		assert_eq!(market_value.eval(&c).unwrap(), Value::Float(22_800.0));

		let weighted = (Expr::field("price") - 200.0) / 2.0 + 1i64;
		assert_eq!(weighted.eval(&c).unwrap(), Value::Float(15.0));
	}

	#[test]
	fn arithmetic_on_null_yields_null() {
		let e = Expr::field("missing") + 1i64;
		assert_eq!(e.eval(&ctx(&[])).unwrap(), Value::Null);
	}

	#[test]
	fn division_by_zero_fails() {
		let e = Expr::lit(1i64) / 0i64;
		assert_eq!(e.eval(&ctx(&[])), Err(ExprError::DivisionByZero));
		let e = Expr::lit(1i64) % 0i64;
		assert_eq!(e.eval(&ctx(&[])), Err(ExprError::DivisionByZero));
	}

	#[test]
	fn modulo_takes_the_sign_of_the_divisor() {
		let c = ctx(&[]);
		assert_eq!((Expr::lit(7i64) % 3i64).eval(&c).unwrap(), Value::Int(1));
		assert_eq!((Expr::lit(7i64) % -3i64).eval(&c).unwrap(), Value::Int(-2));
		assert_eq!((Expr::lit(-7i64) % 3i64).eval(&c).unwrap(), Value::Int(2));
		assert_eq!((Expr::lit(-7i64) % -3i64).eval(&c).unwrap(), Value::Int(-1));
		assert_eq!((Expr::lit(7.5) % -2.0).eval(&c).unwrap(), Value::Float(-0.5));
		assert_eq!((Expr::lit(-7.5) % 2.0).eval(&c).unwrap(), Value::Float(0.5));
	}

	#[test]
	fn integer_overflow_fails() {
		let e = Expr::lit(i64::MAX) + 1i64;
		assert_eq!(e.eval(&ctx(&[])), Err(ExprError::Overflow("+")));
	}

	#[test]
	fn comparison_propagates_null() {
		// A guard referencing an unknown field must come out falsy.
		let guard = Expr::field("nope").gt(0i64);
		let v = guard.eval(&ctx(&[])).unwrap();
		assert_eq!(v, Value::Null);
		assert!(!v.truthy());
	}

	#[test]
	fn logical_ops_short_circuit() {
		// The right side would divide by zero; `and` must not reach it.
		let e = Expr::lit(false).and(Expr::lit(1i64) / 0i64);
		assert_eq!(e.eval(&ctx(&[])).unwrap(), Value::Bool(false));

		let e = Expr::lit("truthy").or(Expr::lit(1i64) / 0i64);
		assert_eq!(e.eval(&ctx(&[])).unwrap(), Value::Str("truthy".to_string()));
	}

	#[test]
	fn functions_evaluate() {
		let c = ctx(&[("x", Value::Float(2.25))]);
		assert_eq!(Expr::field("x").sqrt().eval(&c).unwrap(), Value::Float(1.5));
		assert_eq!(Expr::field("x").ceil().eval(&c).unwrap(), Value::Int(3));
		assert_eq!(Expr::field("x").floor().eval(&c).unwrap(), Value::Int(2));
		assert_eq!(
			Expr::min(vec![Expr::lit(3i64), Expr::lit(7i64), Expr::lit(5i64)]).eval(&c).unwrap(),
			Value::Int(3)
		);
		assert_eq!(Expr::lit(-1.0).sqrt().eval(&c), Err(ExprError::Domain("sqrt", -1.0)));
		assert_eq!(Expr::lit(0.0).log().eval(&c), Err(ExprError::Domain("log", 0.0)));
	}

	#[test]
	fn conditional_and_null_helpers() {
		let e = Expr::if_else(Expr::field("qty").gt(0i64), Expr::lit("open"), Expr::lit("flat"));
		assert_eq!(e.eval(&ctx(&[("qty", Value::Int(5))])).unwrap(), Value::Str("open".into()));
		assert_eq!(e.eval(&ctx(&[("qty", Value::Int(0))])).unwrap(), Value::Str("flat".into()));

		let e = Expr::coalesce(vec![Expr::field("a"), Expr::field("b"), Expr::lit(9i64)]);
		assert_eq!(e.eval(&ctx(&[("b", Value::Int(4))])).unwrap(), Value::Int(4));
		assert_eq!(Expr::field("a").is_null().eval(&ctx(&[])).unwrap(), Value::Bool(true));
	}

	#[test]
	fn string_ops_evaluate() {
		let c = ctx(&[("sym", Value::Str("AAPL".into()))]);
		assert_eq!(Expr::field("sym").length().eval(&c).unwrap(), Value::Int(4));
		assert_eq!(Expr::field("sym").lower().eval(&c).unwrap(), Value::Str("aapl".into()));
		assert_eq!(Expr::field("sym").contains("AP").eval(&c).unwrap(), Value::Bool(true));
		assert_eq!(Expr::field("sym").starts_with("AA").eval(&c).unwrap(), Value::Bool(true));
		assert_eq!(Expr::field("sym").concat("-US").eval(&c).unwrap(), Value::Str("AAPL-US".into()));
	}

	#[test]
	fn sql_compilation_casts_numeric_fields() {
		let e = Expr::field("price") * Expr::field("quantity");
		assert_eq!(e.to_sql("data"), "((data->>'price')::float * (data->>'quantity')::float)");

		let e = Expr::field("symbol").eq("AAPL");
		assert_eq!(e.to_sql("data"), "((data->>'symbol') = 'AAPL')");

		let e = Expr::field("qty").gt(0i64).and(Expr::field("side").eq("BUY"));
		assert_eq!(
			e.to_sql("data"),
			"(((data->>'qty')::float > 0) AND ((data->>'side') = 'BUY'))"
		);
	}

	#[test]
	fn sql_compilation_escapes_strings() {
		let e = Expr::field("name").eq("O'Brien");
		assert_eq!(e.to_sql("data"), "((data->>'name') = 'O''Brien')");
	}

	#[test]
	fn sql_modulo_runs_over_numeric() {
		let e = Expr::field("x") % Expr::field("y");
		assert_eq!(e.to_sql("data"), "((data->>'x')::numeric % (data->>'y')::numeric)");

		let e = Expr::field("x") % 3i64;
		assert_eq!(e.to_sql("data"), "((data->>'x')::numeric % (3)::numeric)");

		// Nested operands carry float casts; the outer modulo re-casts them.
		let e = (Expr::field("a") + Expr::field("b")) % 2i64;
		assert_eq!(
			e.to_sql("data"),
			"((((data->>'a')::float + (data->>'b')::float))::numeric % (2)::numeric)"
		);
	}

	#[test]
	fn sql_compilation_special_forms() {
		let e = Expr::if_else(Expr::field("qty").is_null(), Expr::lit(0i64), Expr::field("qty"));
		assert_eq!(e.to_sql("data"), "CASE WHEN ((data->>'qty') IS NULL) THEN 0 ELSE (data->>'qty') END");

		let e = Expr::coalesce(vec![Expr::field("a"), Expr::lit(1i64)]);
		assert_eq!(e.to_sql("data"), "COALESCE((data->>'a'), 1)");

		let e = Expr::field("sym").contains("AP");
		assert_eq!(e.to_sql("data"), "((data->>'sym') LIKE '%' || 'AP' || '%')");
	}

	#[test]
	fn pure_compilation() {
		let e = Expr::field("price").gt(100i64).and(Expr::field("side").eq("BUY"));
		assert_eq!(e.to_pure("$row"), "(($row.price > 100) && ($row.side == 'BUY'))");

		let e = Expr::if_else(Expr::field("x").is_null(), Expr::lit(0i64), Expr::field("x"));
		assert_eq!(e.to_pure("$row"), "if(isEmpty($row.x), |0, |$row.x)");

		let e = Expr::coalesce(vec![Expr::field("a"), Expr::field("b")]);
		assert_eq!(e.to_pure("$row"), "if(isEmpty($row.a), |$row.b, |$row.a)");

		assert_eq!(Expr::field("sym").upper().to_pure("$row"), "toUpper($row.sym)");
	}

	#[test]
	fn serde_wire_form_matches_contract() {
		let e = Expr::field("price").gt(100i64);
		let json = serde_json::to_value(&e).unwrap();
		assert_eq!(
			json,
			serde_json::json!({
				"type": "BinOp",
				"op": ">",
				"left": {"type": "Field", "name": "price"},
				"right": {"type": "Const", "value": 100},
			})
		);
	}

	#[test]
	fn serde_round_trip_is_observationally_equal() {
		let exprs = vec![
			Expr::field("price") * Expr::field("quantity") + 1i64,
			Expr::if_else(
				Expr::field("qty").gt(0i64).and(Expr::field("side").eq("BUY")),
				Expr::field("price").sqrt(),
				-Expr::field("price"),
			),
			Expr::coalesce(vec![Expr::field("a"), Expr::lit(Value::Null), Expr::lit(2.5)]),
			Expr::field("sym").lower().starts_with("aa").or(Expr::field("sym").length().eq(4i64)),
			Expr::max(vec![Expr::field("x"), Expr::field("y").abs()]).is_null(),
		];
		let c = ctx(&[
			("price", Value::Float(228.0)),
			("quantity", Value::Int(100)),
			("qty", Value::Int(3)),
			("side", Value::Str("BUY".into())),
			("sym", Value::Str("AAPL".into())),
			("x", Value::Int(-2)),
		]);
		for e in exprs {
			let json = serde_json::to_string(&e).unwrap();
			let back: Expr = serde_json::from_str(&json).unwrap();
			assert_eq!(e.eval(&c), back.eval(&c), "round-trip changed semantics: {}", json);
			assert_eq!(e.to_sql("data"), back.to_sql("data"));
		}
	}

	#[test]
	fn fields_are_collected() {
		let e = Expr::if_else(
			Expr::field("qty").gt(0i64),
			Expr::field("price") * Expr::field("qty"),
			Expr::lit(0i64),
		);
		let fields = e.fields();
		assert_eq!(fields.into_iter().collect::<Vec<_>>(), vec!["price", "qty"]);
	}
}
