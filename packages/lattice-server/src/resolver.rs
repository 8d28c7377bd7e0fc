//! User-supplied conflict resolution.
//!
//! Deployments can veto or redirect merges per map (and optionally per
//! key glob) before the CRDT applies them. Resolvers run behind the
//! [`ResolverEvaluator`] trait; the bundled implementation is a small,
//! pure expression language over a fixed context — client-supplied
//! host-language source is never evaluated. A WASM-hosted evaluator fits
//! behind the same trait.
//!
//! The expression language supports comparison, boolean, and arithmetic
//! operators over the identifiers `key`, `local`, `incoming` (with
//! dotted field paths into the values), and `principal.userId`. `local`
//! evaluates to `undefined` when the key has no current value, so
//! "reject any overwrite" is spelled `local != undefined`.

use std::str::Chars;
use std::sync::Arc;

use lattice_core::{Principal, Value};
use parking_lot::RwLock;

use crate::security::glob_match;

/// What a resolver decided about a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Let the CRDT merge proceed.
    Accept,
    /// Refuse the merge; the origin gets a `MERGE_REJECTION`.
    Reject {
        /// Reason reported to the origin.
        reason: String,
    },
    /// Keep the local value; the incoming write is dropped silently.
    PreferLocal,
}

/// Everything a resolver may inspect.
pub struct ResolutionContext<'a> {
    /// Map being written.
    pub map_name: &'a str,
    /// Key being written.
    pub key: &'a str,
    /// Current local value, if the key is visible.
    pub local: Option<&'a Value>,
    /// Incoming value, absent for deletions.
    pub incoming: Option<&'a Value>,
    /// Principal performing the write, absent for cluster-internal ops.
    pub principal: Option<&'a Principal>,
}

/// A conflict resolver implementation.
pub trait ResolverEvaluator: Send + Sync {
    /// Decides the fate of one merge.
    fn evaluate(&self, ctx: &ResolutionContext<'_>) -> Resolution;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Registration {
    map_pattern: String,
    key_glob: Option<String>,
    priority: i32,
    evaluator: Arc<dyn ResolverEvaluator>,
}

/// Priority-ordered resolver registrations.
#[derive(Default)]
pub struct ConflictResolvers {
    entries: RwLock<Vec<Registration>>,
}

impl ConflictResolvers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolver for maps matching `map_pattern` (and keys
    /// matching `key_glob`, when given). Higher priority is consulted
    /// first; ties keep registration order.
    pub fn register(
        &self,
        map_pattern: impl Into<String>,
        key_glob: Option<String>,
        priority: i32,
        evaluator: Arc<dyn ResolverEvaluator>,
    ) {
        let mut entries = self.entries.write();
        entries.push(Registration {
            map_pattern: map_pattern.into(),
            key_glob,
            priority,
            evaluator,
        });
        entries.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// Resolves a merge: the highest-priority matching registration
    /// decides; with no match the merge is accepted.
    #[must_use]
    pub fn resolve(&self, ctx: &ResolutionContext<'_>) -> Resolution {
        let entries = self.entries.read();
        for registration in entries.iter() {
            if !glob_match(&registration.map_pattern, ctx.map_name) {
                continue;
            }
            if let Some(key_glob) = &registration.key_glob {
                if !glob_match(key_glob, ctx.key) {
                    continue;
                }
            }
            return registration.evaluator.evaluate(ctx);
        }
        Resolution::Accept
    }

    /// Whether any resolver is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Expression language
// ---------------------------------------------------------------------------

/// Expression parse failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expression error: {0}")]
pub struct ExprError(String);

/// Runtime value domain of the expression language.
#[derive(Debug, Clone, PartialEq)]
enum ExprValue {
    /// The referenced slot does not exist.
    Undefined,
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// Arrays, maps, bytes: present but not comparable to scalars.
    Complex,
}

impl ExprValue {
    fn truthy(&self) -> bool {
        match self {
            ExprValue::Undefined | ExprValue::Null => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Num(n) => *n != 0.0,
            ExprValue::Str(s) => !s.is_empty(),
            ExprValue::Complex => true,
        }
    }

    fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => ExprValue::Null,
            Value::Bool(b) => ExprValue::Bool(*b),
            #[allow(clippy::cast_precision_loss)] // expression-language tolerance
            Value::Int(i) => ExprValue::Num(*i as f64),
            Value::Float(f) => ExprValue::Num(*f),
            Value::String(s) => ExprValue::Str(s.clone()),
            Value::Bytes(_) | Value::Array(_) | Value::Map(_) => ExprValue::Complex,
        }
    }

    fn equals(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (ExprValue::Undefined, ExprValue::Undefined)
            | (ExprValue::Null, ExprValue::Null) => true,
            (ExprValue::Bool(a), ExprValue::Bool(b)) => a == b,
            (ExprValue::Num(a), ExprValue::Num(b)) => (a - b).abs() < f64::EPSILON,
            (ExprValue::Str(a), ExprValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(ExprValue),
    /// `root.path.through.fields`; root is `key`, `local`, `incoming`,
    /// or `principal`.
    Ident(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

impl Expr {
    fn eval(&self, ctx: &ResolutionContext<'_>) -> ExprValue {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Ident(path) => resolve_ident(path, ctx),
            Expr::Unary(op, inner) => {
                let value = inner.eval(ctx);
                match op {
                    UnaryOp::Not => ExprValue::Bool(!value.truthy()),
                    UnaryOp::Neg => match value {
                        ExprValue::Num(n) => ExprValue::Num(-n),
                        _ => ExprValue::Undefined,
                    },
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                match op {
                    // Short-circuit forms first.
                    BinaryOp::Or => {
                        let left = lhs.eval(ctx);
                        if left.truthy() {
                            return ExprValue::Bool(true);
                        }
                        return ExprValue::Bool(rhs.eval(ctx).truthy());
                    }
                    BinaryOp::And => {
                        let left = lhs.eval(ctx);
                        if !left.truthy() {
                            return ExprValue::Bool(false);
                        }
                        return ExprValue::Bool(rhs.eval(ctx).truthy());
                    }
                    _ => {}
                }

                let left = lhs.eval(ctx);
                let right = rhs.eval(ctx);
                match op {
                    BinaryOp::Eq => ExprValue::Bool(left.equals(&right)),
                    BinaryOp::Ne => ExprValue::Bool(!left.equals(&right)),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                        let ordering = match (&left, &right) {
                            (ExprValue::Num(a), ExprValue::Num(b)) => a.partial_cmp(b),
                            (ExprValue::Str(a), ExprValue::Str(b)) => Some(a.cmp(b)),
                            _ => None,
                        };
                        let Some(ordering) = ordering else {
                            return ExprValue::Bool(false);
                        };
                        ExprValue::Bool(match op {
                            BinaryOp::Lt => ordering.is_lt(),
                            BinaryOp::Le => ordering.is_le(),
                            BinaryOp::Gt => ordering.is_gt(),
                            BinaryOp::Ge => ordering.is_ge(),
                            _ => unreachable!(),
                        })
                    }
                    BinaryOp::Add => match (&left, &right) {
                        (ExprValue::Num(a), ExprValue::Num(b)) => ExprValue::Num(a + b),
                        (ExprValue::Str(a), ExprValue::Str(b)) => {
                            ExprValue::Str(format!("{a}{b}"))
                        }
                        _ => ExprValue::Undefined,
                    },
                    BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                        let (ExprValue::Num(a), ExprValue::Num(b)) = (&left, &right) else {
                            return ExprValue::Undefined;
                        };
                        ExprValue::Num(match op {
                            BinaryOp::Sub => a - b,
                            BinaryOp::Mul => a * b,
                            BinaryOp::Div => a / b,
                            _ => unreachable!(),
                        })
                    }
                    BinaryOp::Or | BinaryOp::And => unreachable!("handled above"),
                }
            }
        }
    }
}

fn resolve_ident(path: &[String], ctx: &ResolutionContext<'_>) -> ExprValue {
    let (root, rest) = path.split_first().expect("parser emits non-empty paths");
    match root.as_str() {
        "key" => ExprValue::Str(ctx.key.to_string()),
        "local" => resolve_value_path(ctx.local, rest),
        "incoming" => resolve_value_path(ctx.incoming, rest),
        "principal" => match (ctx.principal, rest) {
            (Some(p), [field]) if field == "userId" => ExprValue::Str(p.user_id.clone()),
            _ => ExprValue::Undefined,
        },
        _ => ExprValue::Undefined,
    }
}

fn resolve_value_path(base: Option<&Value>, rest: &[String]) -> ExprValue {
    let Some(mut current) = base else {
        return ExprValue::Undefined;
    };
    for segment in rest {
        match current.get_path(segment) {
            Some(next) => current = next,
            None => return ExprValue::Undefined,
        }
    }
    ExprValue::from_value(current)
}

// ---- parser ----

struct Parser<'a> {
    chars: std::iter::Peekable<Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        self.skip_ws();
        if let Some(c) = self.chars.peek() {
            return Err(ExprError(format!("unexpected trailing input at '{c}'")));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat_op("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_equality()?;
        while self.eat_op("&&") {
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_relational()?;
        if self.eat_op("==") {
            let rhs = self.parse_relational()?;
            return Ok(Expr::Binary(BinaryOp::Eq, Box::new(lhs), Box::new(rhs)));
        }
        if self.eat_op("!=") {
            let rhs = self.parse_relational()?;
            return Ok(Expr::Binary(BinaryOp::Ne, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_additive()?;
        for (text, op) in [
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ] {
            if self.eat_op(text) {
                let rhs = self.parse_additive()?;
                return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
            }
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            if self.eat_op("+") {
                let rhs = self.parse_multiplicative()?;
                lhs = Expr::Binary(BinaryOp::Add, Box::new(lhs), Box::new(rhs));
            } else if self.eat_op("-") {
                let rhs = self.parse_multiplicative()?;
                lhs = Expr::Binary(BinaryOp::Sub, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            if self.eat_op("*") {
                let rhs = self.parse_unary()?;
                lhs = Expr::Binary(BinaryOp::Mul, Box::new(lhs), Box::new(rhs));
            } else if self.eat_op("/") {
                let rhs = self.parse_unary()?;
                lhs = Expr::Binary(BinaryOp::Div, Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        if self.eat_op("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        self.skip_ws();
        let Some(&c) = self.chars.peek() else {
            return Err(ExprError("unexpected end of expression".to_string()));
        };

        if c == '(' {
            self.chars.next();
            let inner = self.parse_or()?;
            self.skip_ws();
            if self.chars.next() != Some(')') {
                return Err(ExprError("expected ')'".to_string()));
            }
            return Ok(inner);
        }
        if c == '\'' || c == '"' {
            return self.parse_string(c);
        }
        if c.is_ascii_digit() {
            return self.parse_number();
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return self.parse_ident_or_keyword();
        }
        Err(ExprError(format!("unexpected character '{c}'")))
    }

    fn parse_string(&mut self, quote: char) -> Result<Expr, ExprError> {
        self.chars.next();
        let mut out = String::new();
        for c in self.chars.by_ref() {
            if c == quote {
                return Ok(Expr::Literal(ExprValue::Str(out)));
            }
            out.push(c);
        }
        Err(ExprError("unterminated string literal".to_string()))
    }

    fn parse_number(&mut self) -> Result<Expr, ExprError> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(|n| Expr::Literal(ExprValue::Num(n)))
            .map_err(|_| ExprError(format!("invalid number '{text}'")))
    }

    fn parse_ident_or_keyword(&mut self) -> Result<Expr, ExprError> {
        let mut segments = vec![self.take_word()];
        self.skip_ws();
        while self.chars.peek() == Some(&'.') {
            self.chars.next();
            let word = self.take_word();
            if word.is_empty() {
                return Err(ExprError("expected identifier after '.'".to_string()));
            }
            segments.push(word);
        }

        if segments.len() == 1 {
            match segments[0].as_str() {
                "true" => return Ok(Expr::Literal(ExprValue::Bool(true))),
                "false" => return Ok(Expr::Literal(ExprValue::Bool(false))),
                "null" => return Ok(Expr::Literal(ExprValue::Null)),
                "undefined" => return Ok(Expr::Literal(ExprValue::Undefined)),
                _ => {}
            }
        }
        Ok(Expr::Ident(segments))
    }

    fn take_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        word
    }

    fn skip_ws(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        self.skip_ws();
        let mut lookahead = self.chars.clone();
        for expected in op.chars() {
            if lookahead.next() != Some(expected) {
                return false;
            }
        }
        // Don't let "!" swallow the start of "!=", or "<" the start of "<=".
        if matches!(op, "!" | "<" | ">") && lookahead.clone().next() == Some('=') {
            return false;
        }
        self.chars = lookahead;
        true
    }
}

/// Expression-driven resolver.
///
/// Evaluation order: `reject_when` truthy -> reject with the configured
/// reason; else `prefer_local_when` truthy -> keep local; else accept.
pub struct ExpressionResolver {
    reject_when: Option<Expr>,
    prefer_local_when: Option<Expr>,
    reason: String,
}

impl ExpressionResolver {
    /// Builds a resolver that rejects when `expr` evaluates truthy.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError`] when the expression does not parse.
    pub fn reject_when(expr: &str, reason: impl Into<String>) -> Result<Self, ExprError> {
        Ok(Self {
            reject_when: Some(Parser::new(expr).parse()?),
            prefer_local_when: None,
            reason: reason.into(),
        })
    }

    /// Adds a prefer-local condition checked after the reject condition.
    ///
    /// # Errors
    ///
    /// Returns [`ExprError`] when the expression does not parse.
    pub fn with_prefer_local(mut self, expr: &str) -> Result<Self, ExprError> {
        self.prefer_local_when = Some(Parser::new(expr).parse()?);
        Ok(self)
    }
}

impl ResolverEvaluator for ExpressionResolver {
    fn evaluate(&self, ctx: &ResolutionContext<'_>) -> Resolution {
        if let Some(expr) = &self.reject_when {
            if expr.eval(ctx).truthy() {
                return Resolution::Reject {
                    reason: self.reason.clone(),
                };
            }
        }
        if let Some(expr) = &self.prefer_local_when {
            if expr.eval(ctx).truthy() {
                return Resolution::PreferLocal;
            }
        }
        Resolution::Accept
    }
}
