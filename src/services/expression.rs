//! Expression evaluation over an execution-scoped context.
//!
//! Two surface forms are supported:
//! - substitution: `"path: {{steps.research.output.path}}"` renders a string,
//!   with `| default:"..."` as the fallback for missing values;
//! - predicates: `"{{steps.review.decision}} == 'approved'"` evaluates to a
//!   boolean. Bare paths (`steps.analyze.output.score >= 80`) are accepted
//!   too.
//!
//! Expressions are tiny and re-parsed on every call. Unknown identifiers
//! evaluate to a missing value; comparing missing to anything is false
//! except `== null`. Only syntax errors produce an error; semantic misses
//! never do. Evaluation is pure: no side effects, no I/O.

use chrono::Utc;
use serde_json::Value as Json;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::ProcessExecution;

/// Stateless evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

/// Build the expression context for an execution:
/// `{ input.*, steps.{id}.output.*, steps.{id}.status, now }`.
pub fn execution_context(execution: &ProcessExecution) -> Json {
    let mut steps = serde_json::Map::new();
    for (id, step) in &execution.steps {
        let mut entry = serde_json::Map::new();
        entry.insert(
            "output".to_string(),
            step.output.clone().unwrap_or(Json::Null),
        );
        entry.insert("status".to_string(), Json::String(step.status.as_str().to_string()));
        steps.insert(id.clone(), Json::Object(entry));
    }
    serde_json::json!({
        "input": execution.input,
        "steps": Json::Object(steps),
        "now": Utc::now().to_rfc3339(),
    })
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Render a substitution template. Missing paths render as `""` unless
    /// a `| default:"..."` pipe is given.
    pub fn render(&self, template: &str, ctx: &Json) -> EngineResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                EngineError::Expression(format!("unterminated '{{{{' in template: {template}"))
            })?;
            let inner = &after[..end];
            let value = self.eval(inner, ctx)?;
            out.push_str(&value.render());
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluate a boolean predicate.
    pub fn eval_predicate(&self, expr: &str, ctx: &Json) -> EngineResult<bool> {
        Ok(self.eval(expr, ctx)?.truthy())
    }

    /// Evaluate an expression to a value.
    pub fn eval(&self, expr: &str, ctx: &Json) -> EngineResult<EvalValue> {
        let tokens = lex(expr)?;
        let mut parser = Parser { tokens, pos: 0, ctx };
        let value = parser.expression()?;
        parser.expect_end()?;
        Ok(value)
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    /// Path did not resolve.
    Missing,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl EvalValue {
    fn from_json(value: &Json) -> Self {
        match value {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Missing | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
        }
    }

    /// String form used by substitution.
    pub fn render(&self) -> String {
        match self {
            Self::Missing | Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Self::Str(s) => s.clone(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn equals(&self, other: &Self) -> bool {
        match (self, other) {
            // Missing compares false against everything except null.
            (Self::Missing, Self::Null) | (Self::Null, Self::Missing) => true,
            (Self::Missing, _) | (_, Self::Missing) => false,
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
        }
    }

    fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Missing | Self::Null, _) | (_, Self::Missing | Self::Null) => None,
            (Self::Str(a), Self::Str(b)) => {
                match (self.as_number(), other.as_number()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => Some(a.cmp(b)),
                }
            }
            _ => {
                let a = self.as_number()?;
                let b = other.as_number()?;
                a.partial_cmp(&b)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    OpenTpl,
    CloseTpl,
    Pipe,
    Colon,
}

fn lex(input: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '{' => {
                chars.next();
                if chars.peek() == Some(&'{') {
                    chars.next();
                    tokens.push(Token::OpenTpl);
                } else {
                    return Err(EngineError::Expression("unexpected '{'".into()));
                }
            }
            '}' => {
                chars.next();
                if chars.peek() == Some(&'}') {
                    chars.next();
                    tokens.push(Token::CloseTpl);
                } else {
                    return Err(EngineError::Expression("unexpected '}'".into()));
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::OrOr);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(EngineError::Expression("expected '&&'".into()));
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    return Err(EngineError::Expression("expected '=='".into()));
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    s.push(ch);
                }
                if !closed {
                    return Err(EngineError::Expression(format!(
                        "unterminated string literal in '{input}'"
                    )));
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        // A trailing `.` starting an identifier is not part
                        // of a number; numbers here never end with '.'.
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: f64 = s
                    .parse()
                    .map_err(|_| EngineError::Expression(format!("invalid number '{s}'")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '-' || d == '@' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match s.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => {
                return Err(EngineError::Expression(format!(
                    "unexpected character '{other}' in '{input}'"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a Json,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> EngineResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(EngineError::Expression(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn expect_end(&self) -> EngineResult<()> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(EngineError::Expression(format!(
                "trailing tokens after expression: {:?}",
                &self.tokens[self.pos..]
            )))
        }
    }

    fn expression(&mut self) -> EngineResult<EvalValue> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> EngineResult<EvalValue> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let right = self.and_expr()?;
            left = EvalValue::Bool(left.truthy() || right.truthy());
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> EngineResult<EvalValue> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::AndAnd) {
            let right = self.not_expr()?;
            left = EvalValue::Bool(left.truthy() && right.truthy());
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> EngineResult<EvalValue> {
        if self.eat(&Token::Bang) {
            let value = self.not_expr()?;
            return Ok(EvalValue::Bool(!value.truthy()));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> EngineResult<EvalValue> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Token::EqEq,
            Some(Token::NotEq) => Token::NotEq,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.primary()?;

        use std::cmp::Ordering;
        let result = match op {
            Token::EqEq => left.equals(&right),
            Token::NotEq => {
                // Missing never satisfies an inequality either.
                if left == EvalValue::Missing || right == EvalValue::Missing {
                    false
                } else {
                    !left.equals(&right)
                }
            }
            Token::Lt => left.compare(&right) == Some(Ordering::Less),
            Token::Le => matches!(left.compare(&right), Some(Ordering::Less | Ordering::Equal)),
            Token::Gt => left.compare(&right) == Some(Ordering::Greater),
            Token::Ge => matches!(
                left.compare(&right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            _ => unreachable!("non-comparison token"),
        };
        Ok(EvalValue::Bool(result))
    }

    fn primary(&mut self) -> EngineResult<EvalValue> {
        match self.next() {
            Some(Token::Number(n)) => Ok(EvalValue::Number(n)),
            Some(Token::Str(s)) => Ok(EvalValue::Str(s)),
            Some(Token::True) => Ok(EvalValue::Bool(true)),
            Some(Token::False) => Ok(EvalValue::Bool(false)),
            Some(Token::Null) => Ok(EvalValue::Null),
            Some(Token::LParen) => {
                let value = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::OpenTpl) => {
                let value = self.piped_expression()?;
                self.expect(&Token::CloseTpl)?;
                Ok(value)
            }
            Some(Token::Ident(first)) => self.path(first),
            other => Err(EngineError::Expression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    /// Expression with an optional `| default:"..."` fallback, as found
    /// inside `{{ }}` blocks.
    fn piped_expression(&mut self) -> EngineResult<EvalValue> {
        let value = self.expression()?;
        if self.eat(&Token::Pipe) {
            match self.next() {
                Some(Token::Ident(name)) if name == "default" => {
                    self.expect(&Token::Colon)?;
                    let fallback = match self.next() {
                        Some(Token::Str(s)) => EvalValue::Str(s),
                        Some(Token::Number(n)) => EvalValue::Number(n),
                        other => {
                            return Err(EngineError::Expression(format!(
                                "default pipe expects a literal, found {other:?}"
                            )))
                        }
                    };
                    if matches!(value, EvalValue::Missing | EvalValue::Null) {
                        return Ok(fallback);
                    }
                    return Ok(value);
                }
                other => {
                    return Err(EngineError::Expression(format!(
                        "unknown pipe {other:?}, only 'default' is supported"
                    )))
                }
            }
        }
        Ok(value)
    }

    /// Dotted path lookup into the context tree.
    fn path(&mut self, first: String) -> EngineResult<EvalValue> {
        let mut segments = vec![first];
        while self.eat(&Token::Dot) {
            match self.next() {
                Some(Token::Ident(s)) => segments.push(s),
                other => {
                    return Err(EngineError::Expression(format!(
                        "expected path segment after '.', found {other:?}"
                    )))
                }
            }
        }

        let mut current = self.ctx;
        for segment in &segments {
            match current {
                Json::Object(map) => match map.get(segment) {
                    Some(next) => current = next,
                    None => return Ok(EvalValue::Missing),
                },
                _ => return Ok(EvalValue::Missing),
            }
        }
        Ok(EvalValue::from_json(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Json {
        json!({
            "input": { "topic": "rust", "count": 3 },
            "steps": {
                "analyze": { "output": { "score": 60, "label": "fair" }, "status": "completed" },
                "review": { "output": { "decision": "approved" }, "status": "completed" }
            },
            "now": "2026-01-15T08:00:00Z"
        })
    }

    #[test]
    fn test_substitution() {
        let eval = ExpressionEvaluator::new();
        assert_eq!(
            eval.render("topic: {{input.topic}}, score {{steps.analyze.output.score}}", &ctx())
                .unwrap(),
            "topic: rust, score 60"
        );
    }

    #[test]
    fn test_substitution_missing_renders_empty() {
        let eval = ExpressionEvaluator::new();
        assert_eq!(eval.render("x={{input.nope}}!", &ctx()).unwrap(), "x=!");
    }

    #[test]
    fn test_substitution_default_pipe() {
        let eval = ExpressionEvaluator::new();
        assert_eq!(
            eval.render("{{input.nope | default:\"n/a\"}}", &ctx()).unwrap(),
            "n/a"
        );
        assert_eq!(
            eval.render("{{input.topic | default:\"n/a\"}}", &ctx()).unwrap(),
            "rust"
        );
    }

    #[test]
    fn test_predicate_equality() {
        let eval = ExpressionEvaluator::new();
        assert!(eval
            .eval_predicate("{{steps.review.output.decision}} == 'approved'", &ctx())
            .unwrap());
        assert!(!eval
            .eval_predicate("{{steps.review.output.decision}} == 'rejected'", &ctx())
            .unwrap());
    }

    #[test]
    fn test_predicate_bare_paths_and_ordering() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.eval_predicate("steps.analyze.output.score >= 60", &ctx()).unwrap());
        assert!(!eval.eval_predicate("steps.analyze.output.score >= 80", &ctx()).unwrap());
        assert!(eval.eval_predicate("input.count < 5 && input.count > 0", &ctx()).unwrap());
    }

    #[test]
    fn test_predicate_combinators_and_parens() {
        let eval = ExpressionEvaluator::new();
        assert!(eval
            .eval_predicate("(input.count > 10) || input.topic == 'rust'", &ctx())
            .unwrap());
        assert!(eval.eval_predicate("!(input.count > 10)", &ctx()).unwrap());
    }

    #[test]
    fn test_missing_comparisons() {
        let eval = ExpressionEvaluator::new();
        // Missing compares false against everything...
        assert!(!eval.eval_predicate("input.ghost == 'x'", &ctx()).unwrap());
        assert!(!eval.eval_predicate("input.ghost > 1", &ctx()).unwrap());
        assert!(!eval.eval_predicate("input.ghost != 'x'", &ctx()).unwrap());
        // ...except `== null`.
        assert!(eval.eval_predicate("input.ghost == null", &ctx()).unwrap());
        assert!(!eval.eval_predicate("input.ghost != null", &ctx()).unwrap());
    }

    #[test]
    fn test_number_string_coercion() {
        let eval = ExpressionEvaluator::new();
        let c = json!({"input": {"n": "42"}});
        assert!(eval.eval_predicate("input.n == 42", &c).unwrap());
        assert!(eval.eval_predicate("input.n >= 40", &c).unwrap());
    }

    #[test]
    fn test_syntax_errors() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.eval_predicate("input.count >", &ctx()).is_err());
        assert!(eval.eval_predicate("input.count = 3", &ctx()).is_err());
        assert!(eval.eval_predicate("'unterminated", &ctx()).is_err());
        assert!(eval.render("{{input.topic", &ctx()).is_err());
        assert!(eval.eval_predicate("input.count & 3", &ctx()).is_err());
    }

    #[test]
    fn test_semantic_misses_never_error() {
        let eval = ExpressionEvaluator::new();
        assert!(!eval.eval_predicate("a.b.c.d.e == 'x'", &ctx()).unwrap());
        assert_eq!(eval.render("{{a.b.c}}", &ctx()).unwrap(), "");
    }

    #[test]
    fn test_truthiness() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.eval_predicate("input.topic", &ctx()).unwrap());
        assert!(!eval.eval_predicate("input.ghost", &ctx()).unwrap());
        assert!(eval.eval_predicate("true", &ctx()).unwrap());
        assert!(!eval.eval_predicate("false", &ctx()).unwrap());
    }

    #[test]
    fn test_status_path() {
        let eval = ExpressionEvaluator::new();
        assert!(eval
            .eval_predicate("steps.analyze.status == 'completed'", &ctx())
            .unwrap());
    }

    #[test]
    fn test_execution_context_shape() {
        use crate::domain::models::definition::ProcessDefinition;
        use crate::domain::models::{StepConfig, StepDefinition, TriggeredBy};
        use crate::domain::models::definition::OnError;

        let mut def = ProcessDefinition::new_draft("p", "team", "alice");
        def.steps = vec![StepDefinition {
            id: "a".into(),
            name: "a".into(),
            depends_on: vec![],
            condition: None,
            informed_agents: vec![],
            config: StepConfig::AgentTask {
                agent: "w".into(),
                message: "m".into(),
                timeout_secs: 1,
                max_cost: None,
                retry: None,
                on_error: OnError::Fail,
            },
        }];
        let mut exec = ProcessExecution::new(
            &def,
            json!({"k": "v"}),
            TriggeredBy::manual("alice"),
            "alice",
        );
        exec.begin().unwrap();
        exec.start_step("a").unwrap();
        exec.complete_step("a", json!({"out": 1}), 0.0).unwrap();

        let ctx = execution_context(&exec);
        let eval = ExpressionEvaluator::new();
        assert!(eval.eval_predicate("steps.a.status == 'completed'", &ctx).unwrap());
        assert!(eval.eval_predicate("steps.a.output.out == 1", &ctx).unwrap());
        assert!(eval.eval_predicate("input.k == 'v'", &ctx).unwrap());
    }
}
