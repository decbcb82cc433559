/// Restricted boolean expression language for condition nodes
///
/// Expressions only read from a JSON document; nothing is executed. Supported:
///
/// - literals: numbers, 'single' or "double" quoted strings, `true`, `false`, `null`
/// - dotted paths: `trigger.executionCount`, `fetch.data.status`, `items.0.name`
/// - JSONPath references starting with `$`: `$.fetch.data.headers['content-type']`
/// - comparisons `== != < <= > >=`, boolean `&& || !` (or `and or not`), parentheses

use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Longest accepted condition, in bytes
const MAX_EXPRESSION_LEN: usize = 2048;

/// Deepest accepted nesting of `!` and parentheses
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct ExpressionError(String);

impl ExpressionError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Evaluate `source` against `document` and reduce the result to a boolean
pub fn evaluate_condition(source: &str, document: &Value) -> Result<bool, ExpressionError> {
    Ok(truthy(&evaluate(source, document)?))
}

/// Evaluate `source` against `document`
pub fn evaluate(source: &str, document: &Value) -> Result<Value, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::new("empty expression"));
    }

    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::new(format!("unexpected token {token:?}")));
    }

    eval(&expr, document)
}

/// JSON truthiness: null, false, 0, "" and empty collections are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Path(String),
    JsonPath(String),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Path(String),
    JsonPath(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    if source.len() > MAX_EXPRESSION_LEN {
        return Err(ExpressionError::new(format!(
            "expression longer than {MAX_EXPRESSION_LEN} bytes"
        )));
    }

    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // A leading minus is a sign only where an operand is expected
        let expects_operand = matches!(
            tokens.last(),
            None | Some(Token::Cmp(_) | Token::And | Token::Or | Token::Not | Token::LParen)
        );
        let signed = c == '-' && expects_operand && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());

        if c.is_ascii_digit() || signed {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            // Integers beyond i64 stay floats rather than saturating
            let value = match text.parse::<i64>() {
                Ok(int) => Value::from(int),
                Err(_) => text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| ExpressionError::new(format!("invalid number '{text}'")))?,
            };
            tokens.push(Token::Literal(value));
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExpressionError::new("unterminated string literal")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            '$' => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() {
                    i += 1;
                }
                tokens.push(Token::JsonPath(chars[start..i].iter().collect()));
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
                    ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
                    ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
                    ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
                    ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
                    ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(ExpressionError::new("assignment is not allowed, use '=='")),
                };
                tokens.push(token);
                i += width;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(ExpressionError::new(format!("unexpected '{c}', expected '{c}{c}'")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Path(word),
                });
            }
            other => {
                return Err(ExpressionError::new(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Current `!` and parenthesis nesting
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExpressionError::new("expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            if matches!(self.peek(), Some(Token::Cmp(_))) {
                return Err(ExpressionError::new("chained comparisons are not allowed"));
            }
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Path(path)) => Ok(Expr::Path(path)),
            Some(Token::JsonPath(path)) => Ok(Expr::JsonPath(path)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::new("missing closing parenthesis")),
                }
            }
            Some(token) => Err(ExpressionError::new(format!("unexpected token {token:?}"))),
            None => Err(ExpressionError::new("unexpected end of expression")),
        }
    }
}

fn eval(expr: &Expr, document: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(resolve_path(document, path)),
        Expr::JsonPath(path) => {
            let matches = jsonpath_lib::select(document, path)
                .map_err(|e| ExpressionError::new(format!("invalid JSONPath '{path}': {e:?}")))?;
            Ok(match matches.as_slice() {
                [] => Value::Null,
                [single] => (*single).clone(),
                many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
            })
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, document)?))),
        Expr::And(left, right) => {
            if !truthy(&eval(left, document)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(right, document)?)))
        }
        Expr::Or(left, right) => {
            if truthy(&eval(left, document)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(right, document)?)))
        }
        Expr::Compare(op, left, right) => {
            let left = eval(left, document)?;
            let right = eval(right, document)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn resolve_path(document: &Value, path: &str) -> Value {
    let mut current = document;
    for segment in path.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        let ordering = a
            .partial_cmp(&b)
            .ok_or_else(|| ExpressionError::new("cannot compare NaN"))?;
        return Ok(apply(op, ordering));
    }

    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        _ => match (left, right) {
            (Value::String(a), Value::String(b)) => Ok(apply(op, a.cmp(b))),
            _ => Err(ExpressionError::new(format!(
                "cannot order {} and {}",
                type_name(left),
                type_name(right)
            ))),
        },
    }
}

fn apply(op: CmpOp, ordering: Ordering) -> bool {
    match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "trigger": { "executionCount": 3, "trigger": "schedule" },
            "fetch-weather": {
                "success": true,
                "data": { "status": 200, "body": "sunny", "tags": ["a", "b"] }
            }
        })
    }

    #[test]
    fn comparisons_over_paths() {
        let d = doc();
        assert!(evaluate_condition("fetch-weather.data.status == 200", &d).unwrap());
        assert!(evaluate_condition("trigger.executionCount >= 3", &d).unwrap());
        assert!(!evaluate_condition("trigger.executionCount > 3", &d).unwrap());
        assert!(evaluate_condition("trigger.trigger == 'schedule'", &d).unwrap());
        assert!(evaluate_condition("fetch-weather.data.tags.1 == \"b\"", &d).unwrap());
        assert!(evaluate_condition("trigger.executionCount > -1", &d).unwrap());
    }

    #[test]
    fn boolean_operators_and_grouping() {
        let d = doc();
        assert!(evaluate_condition(
            "fetch-weather.success && (trigger.executionCount < 2 || trigger.trigger != 'manual')",
            &d
        )
        .unwrap());
        assert!(evaluate_condition("not missing.value", &d).unwrap());
        assert!(!evaluate_condition("!fetch-weather.success or false", &d).unwrap());
    }

    #[test]
    fn missing_paths_are_null() {
        let d = doc();
        assert!(evaluate_condition("nope.deep.path == null", &d).unwrap());
        assert!(!evaluate_condition("nope.deep.path", &d).unwrap());
    }

    #[test]
    fn jsonpath_references() {
        let d = doc();
        assert!(evaluate_condition("$..status == 200", &d).unwrap());
        assert!(evaluate_condition("$.trigger.executionCount == 3", &d).unwrap());
        assert!(evaluate_condition("$..nothing == null", &d).unwrap());
    }

    #[test]
    fn rejects_code_like_input() {
        let d = doc();
        assert!(evaluate("process.exit(1)", &d).is_err());
        assert!(evaluate("a = 1", &d).is_err());
        assert!(evaluate("require('fs')", &d).is_err());
        assert!(evaluate("1 < 2 < 3", &d).is_err());
        assert!(evaluate("", &d).is_err());
        assert!(evaluate("'unterminated", &d).is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let d = doc();
        let nots = format!("{}true", "!".repeat(200));
        assert!(evaluate(&nots, &d).is_err());

        let parens = format!("{}true{}", "(".repeat(500), ")".repeat(500));
        let err = evaluate(&parens, &d).unwrap_err();
        assert_eq!(err.to_string(), "expression nested too deeply");

        let long = format!("{}true", "!".repeat(200_000));
        assert!(evaluate_condition(&long, &d).is_err());

        // Nesting within the limit still works
        assert!(evaluate_condition("!!((trigger.executionCount == 3))", &d).unwrap());
    }

    #[test]
    fn large_integers_keep_their_magnitude() {
        let d = doc();
        assert!(evaluate_condition("99999999999999999999 > 9223372036854775807", &d).unwrap());
        assert_eq!(evaluate("42", &d).unwrap(), json!(42));
        assert_eq!(evaluate("-1.5", &d).unwrap(), json!(-1.5));
    }

    #[test]
    fn ordering_mismatched_types_is_an_error() {
        let d = doc();
        assert!(evaluate("fetch-weather.data.body > 3", &d).is_err());
        assert!(evaluate_condition("'b' > 'a'", &d).unwrap());
    }
}
