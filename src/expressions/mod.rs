//! # Expression Evaluation
//!
//! Extension points used by interpolation, scenario guards and pre/post
//! scripts. Everything routes through two small traits so the built-in
//! engines can be swapped without touching call sites:
//!
//! - [`ExpressionEngine`] — evaluates one expression (guards, `js:` / `$js.`
//!   placeholders) or a short script of `;`-separated statements whose
//!   assignments land on the runtime scope.
//! - [`FakeDataProvider`] — serves `faker.CATEGORY.METHOD` placeholders.
//!
//! The built-in engine is a deliberately small expression language, not a
//! JavaScript VM: literals (including backtick strings), variable paths,
//! comparisons with numeric/string coercion, `&& || !`, `+`, `contains` and
//! `matches`. Evaluation failures are reported as errors; the interpolation
//! layer decides whether that means "leave the placeholder verbatim" or
//! "fail the script".

use rand::Rng;
use serde_json::{Number, Value};
use thiserror::Error;

/// Errors from expression parsing or evaluation.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("evaluation error: {0}")]
    Eval(String),
}

/// Variable view an expression evaluates against. Implemented by the
/// variable context (optionally overlaid with response bindings).
pub trait Scope {
    /// Resolve a dotted path to a value, `None` when unknown.
    fn lookup(&self, path: &str) -> Option<Value>;
}

/// A `Scope` over a flat map; used by tests and by isolated call contexts.
pub struct MapScope(pub serde_json::Map<String, Value>);

impl Scope for MapScope {
    fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let root = parts.next()?;
        let mut current = self.0.get(root)?.clone();
        for part in parts {
            current = descend(&current, part)?;
        }
        Some(current)
    }
}

fn descend(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(segment).cloned(),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned()),
        _ => None,
    }
}

/// Result of a script evaluation: the last expression value plus the
/// `name = expr` assignments in statement order.
#[derive(Debug, Default)]
pub struct ScriptOutcome {
    pub value: Value,
    pub assignments: Vec<(String, Value)>,
}

/// Pluggable expression/script evaluator.
pub trait ExpressionEngine: Send + Sync {
    /// Evaluate a single expression.
    fn evaluate(&self, expr: &str, scope: &dyn Scope) -> Result<Value, ExprError>;

    /// Evaluate a script: `;`/newline-separated statements where
    /// `name = expr` assigns and anything else is an expression.
    fn evaluate_script(&self, script: &str, scope: &dyn Scope) -> Result<ScriptOutcome, ExprError>;
}

/// Pluggable fake-data provider for `faker.*` placeholders.
pub trait FakeDataProvider: Send + Sync {
    /// `spec` is everything after the `faker.` prefix, e.g.
    /// `name.first_name` or `number.int(1,10)`.
    fn generate(&self, spec: &str) -> Result<Value, ExprError>;
}

/// Truthiness used by guards: `null`, `false`, `0`, `""`, empty sequences
/// and mappings are falsy; everything else is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Equality with numeric/string coercion: `200 == "200"` holds. Sequences
/// compare elementwise, mappings keywise.
pub fn coercing_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => stringified(left) == stringified(right),
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| coercing_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| coercing_eq(v, w)).unwrap_or(false))
        }
        _ => left == right,
    }
}

/// Numeric view of a value, accepting numeric strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// String rendering used when a value is embedded into a larger string.
pub fn stringified(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ============================================================================
// BUILT-IN ENGINE
// ============================================================================

/// The default [`ExpressionEngine`].
#[derive(Debug, Default)]
pub struct BuiltinEngine;

impl ExpressionEngine for BuiltinEngine {
    fn evaluate(&self, expr: &str, scope: &dyn Scope) -> Result<Value, ExprError> {
        let tokens = tokenize(expr)?;
        let mut parser = Parser::new(tokens);
        let ast = parser.parse_expression()?;
        parser.expect_end()?;
        eval(&ast, scope)
    }

    fn evaluate_script(&self, script: &str, scope: &dyn Scope) -> Result<ScriptOutcome, ExprError> {
        let mut outcome = ScriptOutcome::default();
        // Assignments are visible to later statements through an overlay so
        // a script can build on its own intermediate values.
        let mut overlay = serde_json::Map::new();
        for statement in split_statements(script) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            let layered = LayeredScope {
                overlay: &overlay,
                base: scope,
            };
            match split_assignment(statement) {
                Some((name, expr)) => {
                    let value = self.evaluate(expr, &layered)?;
                    overlay.insert(name.to_string(), value.clone());
                    outcome.assignments.push((name.to_string(), value.clone()));
                    outcome.value = value;
                }
                None => {
                    outcome.value = self.evaluate(statement, &layered)?;
                }
            }
        }
        Ok(outcome)
    }
}

struct LayeredScope<'a> {
    overlay: &'a serde_json::Map<String, Value>,
    base: &'a dyn Scope,
}

impl Scope for LayeredScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        let root = path.split('.').next().unwrap_or(path);
        if let Some(v) = self.overlay.get(root) {
            let mut current = v.clone();
            for part in path.split('.').skip(1) {
                current = descend(&current, part)?;
            }
            return Some(current);
        }
        self.base.lookup(path)
    }
}

/// Split a script on `;` and newlines, respecting quotes.
fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in script.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' | '\n' => {
                    statements.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    statements.push(current);
    statements
}

/// Detect `name = expr` (a single `=`, not part of `==`, `!=`, `<=`, `>=`)
/// where the left side is a plain identifier.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'=' => {
                    let prev = if i > 0 { bytes[i - 1] } else { 0 };
                    let next = bytes.get(i + 1).copied().unwrap_or(0);
                    if prev != b'=' && prev != b'!' && prev != b'<' && prev != b'>' && next != b'='
                    {
                        let name = statement[..i].trim();
                        let is_ident = !name.is_empty()
                            && name
                                .chars()
                                .all(|c| c.is_ascii_alphanumeric() || c == '_');
                        if is_ident {
                            return Some((name, statement[i + 1..].trim()));
                        }
                        return None;
                    }
                }
                _ => {}
            },
        }
    }
    None
}

// ============================================================================
// TOKENIZER / PARSER / EVALUATOR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Path(String),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Contains,
    Matches,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '&'".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '|'".into()));
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '=' in expression".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' | '`' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    literal.push(chars[i]);
                    i += 1;
                }
                if i == chars.len() {
                    return Err(ExprError::Parse(format!("unterminated {quote} string")));
                }
                i += 1;
                tokens.push(Token::Str(literal));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::Parse(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            '-' if chars
                .get(i + 1)
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::Parse(format!("bad number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric()
                        || chars[i] == '_'
                        || chars[i] == '$'
                        || chars[i] == '.'
                        || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "contains" => Token::Contains,
                    "matches" => Token::Matches,
                    _ => Token::Path(word),
                });
            }
            other => return Err(ExprError::Parse(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Ast {
    Lit(Value),
    Path(String),
    Not(Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    Cmp(CmpOp, Box<Ast>, Box<Ast>),
    Add(Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Matches,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExprError::Parse("trailing tokens".into()))
        }
    }

    fn parse_expression(&mut self) -> Result<Ast, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let right = self.parse_not()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Ast, ExprError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            return Ok(Ast::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Ast, ExprError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Contains) => CmpOp::Contains,
            Some(Token::Matches) => CmpOp::Matches,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_additive()?;
        Ok(Ast::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::Plus)) {
            self.bump();
            let right = self.parse_primary()?;
            left = Ast::Add(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Ast, ExprError> {
        match self.bump() {
            Some(Token::Str(s)) => Ok(Ast::Lit(Value::String(s))),
            Some(Token::Num(n)) => Ok(Ast::Lit(number_value(n))),
            Some(Token::Bool(b)) => Ok(Ast::Lit(Value::Bool(b))),
            Some(Token::Null) => Ok(Ast::Lit(Value::Null)),
            Some(Token::Path(p)) => Ok(Ast::Path(p)),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Parse("expected ')'".into())),
                }
            }
            other => Err(ExprError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

fn eval(ast: &Ast, scope: &dyn Scope) -> Result<Value, ExprError> {
    match ast {
        Ast::Lit(v) => Ok(v.clone()),
        // Unknown variables evaluate to null rather than erroring so guards
        // like `error_count > 0` work before the variable exists.
        Ast::Path(p) => Ok(scope.lookup(p).unwrap_or(Value::Null)),
        Ast::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, scope)?))),
        Ast::And(l, r) => {
            if !truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(r, scope)?)))
        }
        Ast::Or(l, r) => {
            if truthy(&eval(l, scope)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(r, scope)?)))
        }
        Ast::Add(l, r) => {
            let left = eval(l, scope)?;
            let right = eval(r, scope)?;
            match (as_number(&left), as_number(&right)) {
                (Some(a), Some(b))
                    if left.is_number() || right.is_number() =>
                {
                    Ok(number_value(a + b))
                }
                _ => Ok(Value::String(format!(
                    "{}{}",
                    stringified(&left),
                    stringified(&right)
                ))),
            }
        }
        Ast::Cmp(op, l, r) => {
            let left = eval(l, scope)?;
            let right = eval(r, scope)?;
            let result = match op {
                CmpOp::Eq => coercing_eq(&left, &right),
                CmpOp::Ne => !coercing_eq(&left, &right),
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                    let (a, b) = match (as_number(&left), as_number(&right)) {
                        (Some(a), Some(b)) => (a, b),
                        _ => match (&left, &right) {
                            (Value::String(a), Value::String(b)) => {
                                let ord = a.cmp(b);
                                return Ok(Value::Bool(match op {
                                    CmpOp::Lt => ord.is_lt(),
                                    CmpOp::Le => ord.is_le(),
                                    CmpOp::Gt => ord.is_gt(),
                                    CmpOp::Ge => ord.is_ge(),
                                    _ => unreachable!(),
                                }));
                            }
                            _ => {
                                return Err(ExprError::Eval(format!(
                                    "cannot order {left} against {right}"
                                )))
                            }
                        },
                    };
                    match op {
                        CmpOp::Lt => a < b,
                        CmpOp::Le => a <= b,
                        CmpOp::Gt => a > b,
                        CmpOp::Ge => a >= b,
                        _ => unreachable!(),
                    }
                }
                CmpOp::Contains => value_contains(&left, &right)?,
                CmpOp::Matches => {
                    let pattern = match &right {
                        Value::String(p) => p,
                        other => {
                            return Err(ExprError::Eval(format!("pattern must be string, got {other}")))
                        }
                    };
                    let re = regex::Regex::new(pattern)
                        .map_err(|e| ExprError::Eval(format!("invalid regex: {e}")))?;
                    match &left {
                        Value::String(s) => re.is_match(s),
                        other => re.is_match(&stringified(other)),
                    }
                }
            };
            Ok(Value::Bool(result))
        }
    }
}

fn value_contains(haystack: &Value, needle: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::String(s) => Ok(s.contains(&stringified(needle))),
        Value::Array(items) => Ok(items.iter().any(|i| coercing_eq(i, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(ExprError::Eval(format!("object key must be string, got {other}"))),
        },
        other => Err(ExprError::Eval(format!("'contains' needs string, sequence or mapping, got {other}"))),
    }
}

// ============================================================================
// FAKE DATA PROVIDER
// ============================================================================

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bruno", "Carla", "Diego", "Elena", "Felipe", "Grace", "Hugo", "Iris", "Jonas",
    "Karin", "Lucas", "Marina", "Nadia", "Otto", "Paula", "Rafael", "Sofia", "Tiago", "Vera",
];

const LAST_NAMES: &[&str] = &[
    "Almeida", "Barros", "Costa", "Duarte", "Esteves", "Ferreira", "Gomes", "Hansen", "Ibarra",
    "Jensen", "Klein", "Lima", "Moreira", "Nunes", "Oliveira", "Pereira", "Ribeiro", "Santos",
    "Teixeira", "Vieira",
];

const LOREM_WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
    "eiusmod", "tempor", "incididunt", "labore", "dolore", "magna", "aliqua",
];

/// The default [`FakeDataProvider`], backed by `rand`.
#[derive(Debug, Default)]
pub struct BuiltinFaker;

impl BuiltinFaker {
    fn pick<'a>(items: &'a [&'a str]) -> &'a str {
        let mut rng = rand::thread_rng();
        items[rng.gen_range(0..items.len())]
    }
}

impl FakeDataProvider for BuiltinFaker {
    fn generate(&self, spec: &str) -> Result<Value, ExprError> {
        let (method, args) = match spec.find('(') {
            Some(open) => {
                let close = spec
                    .rfind(')')
                    .ok_or_else(|| ExprError::Parse(format!("unclosed args in faker.{spec}")))?;
                (
                    &spec[..open],
                    spec[open + 1..close]
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>(),
                )
            }
            None => (spec, Vec::new()),
        };

        let mut rng = rand::thread_rng();
        match method {
            "name.first_name" => Ok(Value::String(Self::pick(FIRST_NAMES).to_string())),
            "name.last_name" => Ok(Value::String(Self::pick(LAST_NAMES).to_string())),
            "name.full_name" => Ok(Value::String(format!(
                "{} {}",
                Self::pick(FIRST_NAMES),
                Self::pick(LAST_NAMES)
            ))),
            "internet.email" => Ok(Value::String(format!(
                "{}.{}{}@example.com",
                Self::pick(FIRST_NAMES).to_lowercase(),
                Self::pick(LAST_NAMES).to_lowercase(),
                rng.gen_range(1..1000)
            ))),
            "internet.user_name" => Ok(Value::String(format!(
                "{}{}",
                Self::pick(FIRST_NAMES).to_lowercase(),
                rng.gen_range(1..10_000)
            ))),
            "internet.url" => Ok(Value::String(format!(
                "https://{}.example.com",
                Self::pick(LOREM_WORDS)
            ))),
            "string.uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
            "string.alpha" => {
                let len: usize = args
                    .first()
                    .and_then(|a| a.parse().ok())
                    .unwrap_or(8);
                let s: String = (0..len)
                    .map(|_| (b'a' + rng.gen_range(0..26)) as char)
                    .collect();
                Ok(Value::String(s))
            }
            "number.int" => {
                let min: i64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                let max: i64 = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(1_000);
                if min > max {
                    return Err(ExprError::Eval(format!("number.int({min},{max}): empty range")));
                }
                Ok(Value::Number(Number::from(rng.gen_range(min..=max))))
            }
            "lorem.word" => Ok(Value::String(Self::pick(LOREM_WORDS).to_string())),
            "lorem.sentence" => {
                let words: Vec<&str> = (0..rng.gen_range(5..10))
                    .map(|_| Self::pick(LOREM_WORDS))
                    .collect();
                Ok(Value::String(format!("{}.", words.join(" "))))
            }
            other => Err(ExprError::Eval(format!("unknown faker method '{other}'"))),
        }
    }
}
