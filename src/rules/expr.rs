//! Expression language of the definition file
//!
//! Rule `read` and `write` sections may contain `!expr`-tagged scalars.
//! These are compiled once at load time into a small AST and evaluated
//! against the [`Scope`] whenever the rule runs. The language covers
//! literals, dotted scope lookups, arithmetic, equality, keyword-argument
//! calls, and the matcher constructors (`pattern`, `prf_state`,
//! `section_state`, `write_prf_state`) plus the `format`, `int`, and
//! `str` builtins.

use std::fmt;
use std::sync::Arc;

use crate::rules::error::RuleError;
use crate::rules::scope::{Matcher, PatternMatcher, Scope, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Attr {
        target: Box<Expr>,
        name: String,
    },
    Call {
        target: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
}

/// An expression compiled from its definition-file source text.
///
/// The source is kept for error reporting; evaluation failures are always
/// logged with the text the definition author wrote.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    expr: Expr,
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!expr {}", self.source)
    }
}

impl CompiledExpr {
    pub fn compile(source: &str) -> Result<Self, RuleError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_expr()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, scope: &Scope) -> Result<Value, RuleError> {
        eval_expr(&self.expr, scope, &self.source)
    }

    /// Load-time checks that do not need a scope: literal regex arguments
    /// to the matcher constructors must compile, so a bad regex fails at
    /// startup instead of silently never matching.
    pub fn validate(&self) -> Result<(), RuleError> {
        validate_expr(&self.expr, &self.source)
    }
}

// --- tokenizer ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Assign,
}

fn tokenize(source: &str) -> Result<Vec<Token>, RuleError> {
    let err = |reason: String| RuleError::CompileError {
        expr: source.to_string(),
        reason,
    };
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::NotEq);
                } else {
                    return Err(err("Unexpected character '!'.".into()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err(err("Unterminated string literal.".into())),
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            None => return Err(err("Unterminated string literal.".into())),
                            Some(esc) if esc == quote || esc == '\\' => s.push(esc),
                            // leave unknown escapes alone so regex classes
                            // like \d and \w survive
                            Some(esc) => {
                                s.push('\\');
                                s.push(esc);
                            }
                        },
                        Some(ch) => s.push(ch),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'.') {
                    // lookahead: a digit must follow, otherwise the dot is
                    // an attribute access on an integer (not supported)
                    let mut clone = chars.clone();
                    clone.next();
                    if clone.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
                        num.push('.');
                        chars.next();
                        while let Some(&d) = chars.peek() {
                            if d.is_ascii_digit() {
                                num.push(d);
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        let f: f64 = num.parse().map_err(|_| {
                            err(format!("Invalid number literal '{num}'."))
                        })?;
                        tokens.push(Token::Float(f));
                        continue;
                    }
                }
                let n: i64 = num
                    .parse()
                    .map_err(|_| err(format!("Invalid number literal '{num}'.")))?;
                tokens.push(Token::Int(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(err(format!("Unexpected character '{other}'."))),
        }
    }
    Ok(tokens)
}

// --- parser ------------------------------------------------------------

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl ToString) -> RuleError {
        RuleError::CompileError {
            expr: self.source.to_string(),
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), RuleError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("Expected {token:?}, found {:?}.", self.peek())))
        }
    }

    fn expect_end(&self) -> Result<(), RuleError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(self.error(format!("Unexpected trailing token {t:?}."))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, RuleError> {
        self.parse_equality()
    }

    fn parse_equality(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, RuleError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, RuleError> {
        if self.eat(&Token::Minus) {
            Ok(Expr::Neg(Box::new(self.parse_unary()?)))
        } else {
            self.parse_postfix()
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, RuleError> {
        let mut expr = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                other => return Err(self.error(format!("Expected attribute name, found {other:?}."))),
            };
            if self.eat(&Token::LParen) {
                let (args, kwargs) = self.parse_args()?;
                expr = Expr::Call {
                    target: Some(Box::new(expr)),
                    name,
                    args,
                    kwargs,
                };
            } else {
                expr = Expr::Attr {
                    target: Box::new(expr),
                    name,
                };
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, RuleError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::Int(n))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.eat(&Token::LParen) {
                        let (args, kwargs) = self.parse_args()?;
                        Ok(Expr::Call {
                            target: None,
                            name,
                            args,
                            kwargs,
                        })
                    } else {
                        Ok(Expr::Var(name))
                    }
                }
            },
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            other => Err(self.error(format!("Unexpected token {other:?}."))),
        }
    }

    fn parse_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), RuleError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok((args, kwargs));
        }
        loop {
            // keyword argument: IDENT '=' expr
            if let (Some(Token::Ident(name)), Some(Token::Assign)) =
                (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
            {
                let name = name.clone();
                self.pos += 2;
                let value = self.parse_expr()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(
                        self.error("Positional argument after keyword argument.".to_string())
                    );
                }
                args.push(self.parse_expr()?);
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok((args, kwargs));
        }
    }
}

// --- evaluation --------------------------------------------------------

fn eval_expr(expr: &Expr, scope: &Scope, source: &str) -> Result<Value, RuleError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => scope
            .lookup(name)
            .ok_or_else(|| RuleError::eval(source, format!("The name '{name}' is not defined."))),
        Expr::Attr { target, name } => {
            let value = eval_expr(target, scope, source)?;
            value.attr(name).ok_or_else(|| {
                RuleError::eval(
                    source,
                    format!("The {} value has no attribute '{name}'.", value.type_name()),
                )
            })
        }
        Expr::Call {
            target: Some(target),
            name,
            args,
            kwargs,
        } => {
            let value = eval_expr(target, scope, source)?;
            if !kwargs.is_empty() {
                return Err(RuleError::eval(
                    source,
                    format!("The method '{name}' takes no keyword arguments."),
                ));
            }
            let args = eval_args(args, scope, source)?;
            eval_method(&value, name, &args, source)
        }
        Expr::Call {
            target: None,
            name,
            args,
            kwargs,
        } => eval_builtin(name, args, kwargs, scope, source),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval_expr(lhs, scope, source)?;
            let rhs = eval_expr(rhs, scope, source)?;
            eval_binary(*op, &lhs, &rhs, source)
        }
        Expr::Neg(inner) => match eval_expr(inner, scope, source)? {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(RuleError::eval(
                source,
                format!("Cannot negate a {} value.", other.type_name()),
            )),
        },
    }
}

fn eval_args(args: &[Expr], scope: &Scope, source: &str) -> Result<Vec<Value>, RuleError> {
    args.iter().map(|a| eval_expr(a, scope, source)).collect()
}

fn eval_method(value: &Value, name: &str, args: &[Value], source: &str) -> Result<Value, RuleError> {
    match (value, name) {
        (Value::Matcher(m), "group") => {
            let n = match args {
                [Value::Int(n)] if *n >= 0 => *n as usize,
                _ => {
                    return Err(RuleError::eval(
                        source,
                        "group() takes a single non-negative integer argument.",
                    ))
                }
            };
            Ok(m.group(n).map(Value::Str).unwrap_or(Value::Null))
        }
        _ => Err(RuleError::eval(
            source,
            format!("The {} value has no method '{name}'.", value.type_name()),
        )),
    }
}

fn eval_builtin(
    name: &str,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    scope: &Scope,
    source: &str,
) -> Result<Value, RuleError> {
    let no_kwargs = |name: &str| -> Result<(), RuleError> {
        if kwargs.is_empty() {
            Ok(())
        } else {
            Err(RuleError::eval(
                source,
                format!("The function '{name}' takes no keyword arguments."),
            ))
        }
    };
    match name {
        "pattern" => {
            no_kwargs(name)?;
            let args = eval_args(args, scope, source)?;
            match args.as_slice() {
                [Value::Str(p)] => Ok(Value::Matcher(Arc::new(Matcher::Pattern(
                    PatternMatcher::new(p)?,
                )))),
                _ => Err(RuleError::eval(
                    source,
                    "pattern() takes a single string argument.",
                )),
            }
        }
        "prf_state" => {
            no_kwargs(name)?;
            let args = eval_args(args, scope, source)?;
            match args.as_slice() {
                [Value::Int(pos)] if *pos >= 0 => {
                    Ok(Value::Matcher(scope.registry().prf_state(*pos as usize)))
                }
                _ => Err(RuleError::eval(
                    source,
                    "prf_state() takes a single non-negative integer argument.",
                )),
            }
        }
        "section_state" => {
            no_kwargs(name)?;
            let args = eval_args(args, scope, source)?;
            match args.as_slice() {
                [Value::Str(p), Value::Int(g1), Value::Int(g2)] if *g1 >= 0 && *g2 >= 0 => {
                    Ok(Value::Matcher(scope.registry().section_state(
                        p,
                        *g1 as usize,
                        *g2 as usize,
                    )?))
                }
                _ => Err(RuleError::eval(
                    source,
                    "section_state() takes a pattern and two group indexes.",
                )),
            }
        }
        "write_prf_state" => {
            no_kwargs(name)?;
            if !args.is_empty() {
                return Err(RuleError::eval(source, "write_prf_state() takes no arguments."));
            }
            scope.registry().arm_prfstate();
            Ok(Value::Str(crate::rules::scope::PRFSTATE_PREFIX.to_string()))
        }
        "format" => {
            let args = eval_args(args, scope, source)?;
            let template = match args.as_slice() {
                [Value::Str(t)] => t,
                _ => {
                    return Err(RuleError::eval(
                        source,
                        "format() takes a template string plus keyword arguments.",
                    ))
                }
            };
            let mut bindings = Vec::with_capacity(kwargs.len());
            for (key, expr) in kwargs {
                bindings.push((key.as_str(), eval_expr(expr, scope, source)?));
            }
            format_template(template, &bindings, source).map(Value::Str)
        }
        "int" => {
            no_kwargs(name)?;
            let args = eval_args(args, scope, source)?;
            match args.as_slice() {
                [Value::Int(n)] => Ok(Value::Int(*n)),
                [Value::Float(f)] => Ok(Value::Int(*f as i64)),
                [Value::Str(s)] => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    RuleError::eval(source, format!("Cannot convert '{s}' to an integer."))
                }),
                _ => Err(RuleError::eval(
                    source,
                    "int() takes a single numeric or string argument.",
                )),
            }
        }
        "str" => {
            no_kwargs(name)?;
            let args = eval_args(args, scope, source)?;
            match args.as_slice() {
                [v] => Ok(Value::Str(v.to_string())),
                _ => Err(RuleError::eval(source, "str() takes a single argument.")),
            }
        }
        _ => Err(RuleError::eval(
            source,
            format!("The function '{name}' is not defined."),
        )),
    }
}

/// Replaces `{name}` placeholders in a template with keyword bindings.
fn format_template(
    template: &str,
    bindings: &[(&str, Value)],
    source: &str,
) -> Result<String, RuleError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let mut key = String::new();
        loop {
            match chars.next() {
                Some('}') => break,
                Some(ch) => key.push(ch),
                None => {
                    return Err(RuleError::eval(
                        source,
                        format!("Unterminated placeholder in template '{template}'."),
                    ))
                }
            }
        }
        match bindings.iter().find(|(k, _)| *k == key) {
            Some((_, v)) => out.push_str(&v.to_string()),
            None => {
                return Err(RuleError::eval(
                    source,
                    format!("The placeholder '{{{key}}}' has no binding."),
                ))
            }
        }
    }
    Ok(out)
}

/// Renders a plain-string write template against a payload map. Used for
/// `mqtt2serial` rules whose `write` is not an expression.
pub fn render_template(template: &str, data: &Value) -> Result<String, RuleError> {
    let bindings: Vec<(&str, Value)> = match data {
        Value::Map(m) => m.iter().map(|(k, v)| (k.as_str(), v.clone())).collect(),
        _ => Vec::new(),
    };
    format_template(template, &bindings, template)
}

fn eval_binary(op: BinOp, lhs: &Value, rhs: &Value, source: &str) -> Result<Value, RuleError> {
    use BinOp::*;
    match op {
        Eq => return Ok(Value::Bool(lhs == rhs)),
        Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    if let (Add, Value::Str(a), Value::Str(b)) = (op, lhs, rhs) {
        return Ok(Value::Str(format!("{a}{b}")));
    }
    let numeric = |v: &Value| -> Option<f64> {
        match v {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    };
    let (a, b) = match (numeric(lhs), numeric(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(RuleError::eval(
                source,
                format!(
                    "Cannot apply the operator to {} and {} values.",
                    lhs.type_name(),
                    rhs.type_name()
                ),
            ))
        }
    };
    let both_int = matches!((lhs, rhs), (Value::Int(_), Value::Int(_)));
    let result = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => {
            if b == 0.0 {
                return Err(RuleError::eval(source, "Division by zero."));
            }
            a / b
        }
        Rem => {
            if b == 0.0 {
                return Err(RuleError::eval(source, "Division by zero."));
            }
            a % b
        }
        Eq | Ne => unreachable!(),
    };
    if both_int && result.fract() == 0.0 && op != Div {
        Ok(Value::Int(result as i64))
    } else {
        Ok(Value::Float(result))
    }
}

fn validate_expr(expr: &Expr, source: &str) -> Result<(), RuleError> {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => Ok(()),
        Expr::Attr { target, .. } => validate_expr(target, source),
        Expr::Neg(inner) => validate_expr(inner, source),
        Expr::Binary { lhs, rhs, .. } => {
            validate_expr(lhs, source)?;
            validate_expr(rhs, source)
        }
        Expr::Call {
            target,
            name,
            args,
            kwargs,
        } => {
            if let Some(target) = target {
                validate_expr(target, source)?;
            }
            for arg in args {
                validate_expr(arg, source)?;
            }
            for (_, arg) in kwargs {
                validate_expr(arg, source)?;
            }
            // regex literals are compile-checked at load time
            if target.is_none() && (name == "pattern" || name == "section_state") {
                if let Some(Expr::Literal(Value::Str(p))) = args.first() {
                    PatternMatcher::new(p)?;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prfstate::PrfTracker;
    use crate::rules::scope::MatcherRegistry;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn scope() -> Scope {
        let tracker = Arc::new(Mutex::new(PrfTracker::new(16)));
        Scope::new(Value::Null, Arc::new(MatcherRegistry::new(tracker)))
    }

    fn eval(source: &str, scope: &Scope) -> Value {
        CompiledExpr::compile(source).unwrap().eval(scope).unwrap()
    }

    #[test]
    fn literals_and_arithmetic() {
        let s = scope();
        assert_eq!(eval("1 + 2 * 3", &s), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3", &s), Value::Int(9));
        assert_eq!(eval("-4 + 1", &s), Value::Int(-3));
        assert_eq!(eval("7 / 2", &s), Value::Float(3.5));
        assert_eq!(eval("'a' + 'b'", &s), Value::Str("ab".into()));
        assert_eq!(eval("1 == 1.0", &s), Value::Bool(true));
        assert_eq!(eval("'x' != 'y'", &s), Value::Bool(true));
    }

    #[test]
    fn data_lookup_and_attributes() {
        let mut s = scope();
        let mut map = BTreeMap::new();
        map.insert("pin".to_string(), Value::Str("1234".into()));
        s.install_data(Value::Map(map));
        assert_eq!(eval("data.pin", &s), Value::Str("1234".into()));
    }

    #[test]
    fn undefined_name_is_an_eval_error() {
        let s = scope();
        let e = CompiledExpr::compile("nothing + 1").unwrap().eval(&s);
        assert!(matches!(e, Err(RuleError::EvalError { .. })));
    }

    #[test]
    fn pattern_builtin_produces_matcher_with_groups() {
        let s = scope();
        let v = eval(r"pattern('STATE (\d+) (\w+)')", &s);
        assert!(v.matches_line("STATE 2 READY"));
        match &v {
            Value::Matcher(m) => assert_eq!(m.group(2).as_deref(), Some("READY")),
            other => panic!("expected matcher, got {other:?}"),
        }
    }

    #[test]
    fn format_builtin_with_kwargs() {
        let mut s = scope();
        let mut map = BTreeMap::new();
        map.insert("pin".to_string(), Value::Str("1234".into()));
        map.insert("section_code".to_string(), Value::Int(1));
        s.install_data(Value::Map(map));
        let v = eval(
            "format('{pin} SET {code}', pin=data.pin, code=data.section_code)",
            &s,
        );
        assert_eq!(v, Value::Str("1234 SET 1".into()));
    }

    #[test]
    fn int_builtin_parses_captured_groups() {
        let s = scope();
        assert_eq!(eval("int('42')", &s), Value::Int(42));
        assert_eq!(eval("int(3.9)", &s), Value::Int(3));
        assert!(CompiledExpr::compile("int('x')").unwrap().eval(&s).is_err());
    }

    #[test]
    fn write_prf_state_arms_the_tracker() {
        let s = scope();
        assert_eq!(eval("write_prf_state()", &s), Value::Str("PRFSTATE".into()));
        let tracker = s.registry().tracker();
        tracker.lock().unwrap().record("0000").unwrap();
        // armed snapshot reports every position as changed
        assert!(tracker.lock().unwrap().changed(5));
    }

    #[test]
    fn bad_regex_fails_validation() {
        let e = CompiledExpr::compile("pattern('(')").unwrap().validate();
        assert!(matches!(e, Err(RuleError::CompileError { .. })));
    }

    #[test]
    fn render_template_substitutes_payload_fields() {
        let mut map = BTreeMap::new();
        map.insert("pin".to_string(), Value::Str("1234".into()));
        map.insert("section_code".to_string(), Value::Int(1));
        let line = render_template("{pin} SET {section_code}", &Value::Map(map)).unwrap();
        assert_eq!(line, "1234 SET 1");
    }

    #[test]
    fn compile_errors_carry_the_source() {
        match CompiledExpr::compile("1 +") {
            Err(RuleError::CompileError { expr, .. }) => assert_eq!(expr, "1 +"),
            other => panic!("expected compile error, got {other:?}"),
        }
    }
}
