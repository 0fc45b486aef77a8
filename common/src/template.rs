//! Sandboxed expression language for template schedules.
//!
//! A program is a list of `let name = expr;` bindings followed by one result
//! expression. Values are JSON values; numbers are `f64`. Programs can read entity
//! state through a [`StateSource`] and nothing else.

use serde_json::{Map, Number, Value};

use crate::{error::TemplateError, sensor::StateSource};

/// Day/night heating program used when a template schedule has no template of its own.
pub const DEFAULT_TEMPLATE: &str = r#"
# Night keeps a minimum, mornings warm up when it is cold outside, days heat to target.
let room_temp = float(states(room_temp_sensor), 0);
let outside_temp = if weather_entity then float(state_attr(weather_entity, 'temperature'), 0)
    else if outside_temp_sensor then float(states(outside_temp_sensor), 0)
    else 0;
let temp_diff = abs(room_temp - outside_temp);

if now >= night_start or now < night_end then
    if room_temp < min_temp then
        { "active": true, "target_temp": min_temp, "mode": "night_minimum" }
    else
        { "active": false, "target_temp": min_temp, "mode": "night_idle" }
else if now == morning_time and temp_diff > temp_diff_threshold then
    { "active": true, "target_temp": target_temp, "mode": "morning_warmup" }
else if room_temp < target_temp then
    { "active": true, "target_temp": target_temp, "mode": "day_heating" }
else
    { "active": false, "target_temp": target_temp, "mode": "day_comfortable" }
"#;

/// Operator variables every template sees unless overridden.
pub fn default_variables() -> Map<String, Value> {
    let mut variables = Map::new();
    variables.insert("min_temp".to_string(), Value::from(15));
    variables.insert("target_temp".to_string(), Value::from(20));
    variables.insert("max_temp".to_string(), Value::from(25));
    variables.insert("temp_diff_threshold".to_string(), Value::from(2));
    variables.insert("morning_time".to_string(), Value::from("06:30"));
    variables.insert("night_start".to_string(), Value::from("22:00"));
    variables.insert("night_end".to_string(), Value::from("06:30"));
    variables
}

pub struct TemplateContext<'a> {
    pub variables: Map<String, Value>,
    pub states: &'a dyn StateSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    program: Program,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let tokens = tokenize(source)?;
        let program = Parser { tokens, pos: 0 }.program()?;
        Ok(Self { program })
    }

    pub fn evaluate(&self, context: &TemplateContext<'_>) -> Result<Value, TemplateError> {
        let mut evaluator = Evaluator {
            context,
            locals: Map::new(),
        };
        for (name, expr) in &self.program.bindings {
            let value = evaluator.eval(expr)?;
            evaluator.locals.insert(name.clone(), value);
        }
        evaluator.eval(&self.program.result)
    }

    /// Evaluates and renders the result as text.
    pub fn render(&self, context: &TemplateContext<'_>) -> Result<String, TemplateError> {
        self.evaluate(context).map(|value| render_value(&value))
    }
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Interpreted {
    Object(Map<String, Value>),
    Flag(bool),
}

/// Structured output when the text is a JSON object, otherwise a loose boolean token,
/// otherwise the truthiness of the raw text.
pub fn interpret_output(raw: &str) -> Interpreted {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return Interpreted::Object(map);
        }
    }

    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Interpreted::Flag(true),
        "false" | "off" | "no" | "0" => Interpreted::Flag(false),
        _ => Interpreted::Flag(!trimmed.is_empty()),
    }
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Spanned {
    token: Token,
    offset: usize,
}

const KEYWORDS: &[&str] = &[
    "let", "if", "then", "else", "and", "or", "not", "true", "false", "null",
];

fn syntax(offset: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '#' {
            while chars.next_if(|&(_, c)| c != '\n').is_some() {}
            continue;
        }

        let token = if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some((_, digit)) = chars.next_if(|&(_, c)| c.is_ascii_digit() || c == '.') {
                literal.push(digit);
            }
            let number = literal
                .parse::<f64>()
                .map_err(|_| syntax(offset, format!("invalid number '{literal}'")))?;
            Token::Number(number)
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some((_, ch)) if ch == c => break,
                    Some((_, '\\')) => match chars.next() {
                        Some((_, 'n')) => text.push('\n'),
                        Some((_, 't')) => text.push('\t'),
                        Some((_, escaped)) => text.push(escaped),
                        None => return Err(syntax(offset, "unterminated string")),
                    },
                    Some((_, ch)) => text.push(ch),
                    None => return Err(syntax(offset, "unterminated string")),
                }
            }
            Token::Str(text)
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some((_, ch)) = chars.next_if(|&(_, c)| c.is_alphanumeric() || c == '_') {
                ident.push(ch);
            }
            Token::Ident(ident)
        } else {
            chars.next();
            let mut followed_by_eq = || chars.next_if(|&(_, c)| c == '=').is_some();
            match c {
                '(' => Token::LParen,
                ')' => Token::RParen,
                '{' => Token::LBrace,
                '}' => Token::RBrace,
                ',' => Token::Comma,
                ':' => Token::Colon,
                ';' => Token::Semi,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '=' if followed_by_eq() => Token::Eq,
                '=' => Token::Assign,
                '!' if followed_by_eq() => Token::Ne,
                '<' if followed_by_eq() => Token::Le,
                '<' => Token::Lt,
                '>' if followed_by_eq() => Token::Ge,
                '>' => Token::Gt,
                other => return Err(syntax(offset, format!("unexpected character '{other}'"))),
            }
        };

        tokens.push(Spanned { token, offset });
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: source.len(),
    });
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    States,
    StateAttr,
    Float,
    Abs,
    Min,
    Max,
    IsState,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "states" => Self::States,
            "state_attr" => Self::StateAttr,
            "float" => Self::Float,
            "abs" => Self::Abs,
            "min" => Self::Min,
            "max" => Self::Max,
            "is_state" => Self::IsState,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::States => "states",
            Self::StateAttr => "state_attr",
            Self::Float => "float",
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::IsState => "is_state",
        }
    }

    fn check_arity(self, got: usize) -> Result<(), TemplateError> {
        let (min, max, expected) = match self {
            Self::States | Self::Abs => (1, 1, "1"),
            Self::Float => (1, 2, "1 or 2"),
            Self::StateAttr | Self::Min | Self::Max | Self::IsState => (2, 2, "2"),
        };
        if (min..=max).contains(&got) {
            Ok(())
        } else {
            Err(TemplateError::Arity {
                function: self.name(),
                expected,
                got,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    Object(Vec<(String, Expr)>),
}

#[derive(Debug, Clone, PartialEq)]
struct Program {
    bindings: Vec<(String, Expr)>,
    result: Expr,
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn current(&self) -> &Spanned {
        // tokenize always terminates the stream with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        syntax(self.current().offset, message)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.at_keyword(keyword);
        if found {
            self.advance();
        }
        found
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), TemplateError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{keyword}'")))
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), TemplateError> {
        if self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn program(mut self) -> Result<Program, TemplateError> {
        let mut bindings = Vec::new();
        while self.eat_keyword("let") {
            let name = match self.advance() {
                Token::Ident(name) if !KEYWORDS.contains(&name.as_str()) => name,
                _ => return Err(self.error("expected a variable name after 'let'")),
            };
            self.expect(&Token::Assign, "'='")?;
            let value = self.expression()?;
            self.expect(&Token::Semi, "';'")?;
            bindings.push((name, value));
        }

        let result = self.expression()?;
        if *self.peek() != Token::Eof {
            return Err(self.error("unexpected input after result expression"));
        }
        Ok(Program { bindings, result })
    }

    fn expression(&mut self) -> Result<Expr, TemplateError> {
        if self.eat_keyword("if") {
            let condition = self.expression()?;
            self.expect_keyword("then")?;
            let then = self.expression()?;
            self.expect_keyword("else")?;
            let otherwise = self.expression()?;
            return Ok(Expr::If(
                Box::new(condition),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        self.or()
    }

    fn or(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.and()?;
        while self.eat_keyword("or") {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.not()?;
        while self.eat_keyword("and") {
            let rhs = self.not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, TemplateError> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, TemplateError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, TemplateError> {
        if *self.peek() == Token::Minus {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        match self.advance() {
            Token::Number(number) => Ok(Expr::Literal(number_value(number))),
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBrace => self.object(),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                keyword if KEYWORDS.contains(&keyword) => {
                    Err(self.error(format!("unexpected keyword '{keyword}'")))
                }
                _ if *self.peek() == Token::LParen => self.call(name),
                _ => Ok(Expr::Var(name)),
            },
            Token::Eof => Err(self.error("unexpected end of template")),
            other => Err(self.error(format!("unexpected token {other:?}"))),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, TemplateError> {
        let function = Function::lookup(&name).ok_or(TemplateError::UnknownFunction(name))?;
        self.expect(&Token::LParen, "'('")?;

        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            loop {
                args.push(self.expression()?);
                if *self.peek() != Token::Comma {
                    break;
                }
                self.advance();
            }
        }
        self.expect(&Token::RParen, "')'")?;

        function.check_arity(args.len())?;
        Ok(Expr::Call(function, args))
    }

    fn object(&mut self) -> Result<Expr, TemplateError> {
        let mut fields = Vec::new();
        while *self.peek() != Token::RBrace {
            let key = match self.advance() {
                Token::Str(key) | Token::Ident(key) => key,
                _ => return Err(self.error("expected an object key")),
            };
            self.expect(&Token::Colon, "':'")?;
            fields.push((key, self.expression()?));
            if *self.peek() == Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RBrace, "'}'")?;
        Ok(Expr::Object(fields))
    }
}

// ---------------------------------------------------------------------------
// Evaluator

static NULL: Value = Value::Null;

fn number_value(number: f64) -> Value {
    Number::from_f64(number).map_or(Value::Null, Value::Number)
}

fn as_number(value: &Value, what: &str) -> Result<f64, TemplateError> {
    value
        .as_f64()
        .ok_or_else(|| TemplateError::Type(format!("{what} expects a number, got {value}")))
}

struct Evaluator<'a> {
    context: &'a TemplateContext<'a>,
    locals: Map<String, Value>,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, TemplateError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => self
                .locals
                .get(name)
                .or_else(|| self.context.variables.get(name))
                .cloned()
                .ok_or_else(|| TemplateError::UndefinedVariable(name.clone())),
            Expr::Neg(inner) => Ok(number_value(-as_number(&self.eval(inner)?, "'-'")?)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(inner)?))),
            Expr::If(condition, then, otherwise) => {
                if is_truthy(&self.eval(condition)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                Ok(Value::Bool(is_truthy(&self.eval(lhs)?) || is_truthy(&self.eval(rhs)?)))
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                Ok(Value::Bool(is_truthy(&self.eval(lhs)?) && is_truthy(&self.eval(rhs)?)))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Call(function, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(*function, &args)
            }
        }
    }

    fn call(&self, function: Function, args: &[Value]) -> Result<Value, TemplateError> {
        let arg = |index: usize| args.get(index).unwrap_or(&NULL);

        match function {
            Function::States => Ok(Value::String(self.entity_state(arg(0)))),
            Function::StateAttr => {
                let (Value::String(id), Value::String(name)) = (arg(0), arg(1)) else {
                    return Ok(Value::Null);
                };
                Ok(self
                    .context
                    .states
                    .entity(id)
                    .and_then(|entity| entity.attributes.get(name).cloned())
                    .unwrap_or(Value::Null))
            }
            Function::Float => {
                let fallback = args.get(1).cloned().unwrap_or_else(|| number_value(0.0));
                let parsed = match arg(0) {
                    Value::Number(number) => number.as_f64(),
                    Value::String(text) => text.trim().parse::<f64>().ok(),
                    Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
                    _ => None,
                };
                Ok(parsed
                    .filter(|number| number.is_finite())
                    .map_or(fallback, number_value))
            }
            Function::Abs => Ok(number_value(as_number(arg(0), "abs()")?.abs())),
            Function::Min => Ok(number_value(
                as_number(arg(0), "min()")?.min(as_number(arg(1), "min()")?),
            )),
            Function::Max => Ok(number_value(
                as_number(arg(0), "max()")?.max(as_number(arg(1), "max()")?),
            )),
            Function::IsState => Ok(Value::Bool(
                self.entity_state(arg(0)) == render_value(arg(1)),
            )),
        }
    }

    fn entity_state(&self, id: &Value) -> String {
        id.as_str()
            .and_then(|id| self.context.states.entity(id))
            .map_or_else(|| "unknown".to_string(), |entity| entity.state)
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, TemplateError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (Value::Number(_), Value::Number(_)) => {
                    as_number(lhs, "comparison")?.partial_cmp(&as_number(rhs, "comparison")?)
                }
                _ => {
                    return Err(TemplateError::Type(format!(
                        "cannot compare {lhs} with {rhs}"
                    )))
                }
            };
            let Some(ordering) = ordering else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Ok(number_value(as_number(lhs, "'+'")? + as_number(rhs, "'+'")?)),
        },
        BinaryOp::Sub => Ok(number_value(as_number(lhs, "'-'")? - as_number(rhs, "'-'")?)),
        BinaryOp::Mul => Ok(number_value(as_number(lhs, "'*'")? * as_number(rhs, "'*'")?)),
        BinaryOp::Div => {
            let divisor = as_number(rhs, "'/'")?;
            if divisor == 0.0 {
                return Err(TemplateError::DivisionByZero);
            }
            Ok(number_value(as_number(lhs, "'/'")? / divisor))
        }
        BinaryOp::Or => Ok(Value::Bool(is_truthy(lhs) || is_truthy(rhs))),
        BinaryOp::And => Ok(Value::Bool(is_truthy(lhs) && is_truthy(rhs))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sensor::EntityState;
    use pretty_assertions::assert_eq;

    fn context<'a>(states: &'a HashMap<String, EntityState>, now: &str) -> TemplateContext<'a> {
        let mut variables = default_variables();
        variables.insert("room_temp_sensor".to_string(), Value::from("sensor.room"));
        variables.insert("weather_entity".to_string(), Value::from("weather.home"));
        variables.insert("outside_temp_sensor".to_string(), Value::Null);
        variables.insert("now".to_string(), Value::from(now));
        TemplateContext { variables, states }
    }

    fn states(room: &str, outside: f64) -> HashMap<String, EntityState> {
        let mut states = HashMap::new();
        states.insert("sensor.room".to_string(), EntityState::new(room));
        states.insert(
            "weather.home".to_string(),
            EntityState::new("cloudy").with_attribute("temperature", outside),
        );
        states
    }

    fn mode_of(template: &Template, context: &TemplateContext<'_>) -> (bool, String) {
        let value = template.evaluate(context).unwrap();
        (
            value["active"].as_bool().unwrap(),
            value["mode"].as_str().unwrap().to_string(),
        )
    }

    #[test]
    fn default_program_follows_day_and_night() {
        let template = Template::compile(DEFAULT_TEMPLATE).unwrap();

        let cold = states("14.0", 2.0);
        assert_eq!(
            mode_of(&template, &context(&cold, "23:15")),
            (true, "night_minimum".to_string())
        );
        assert_eq!(
            mode_of(&template, &context(&cold, "06:30")),
            (true, "morning_warmup".to_string())
        );
        assert_eq!(
            mode_of(&template, &context(&cold, "12:00")),
            (true, "day_heating".to_string())
        );

        let warm = states("21.0", 18.0);
        assert_eq!(
            mode_of(&template, &context(&warm, "05:59")),
            (false, "night_idle".to_string())
        );
        assert_eq!(
            mode_of(&template, &context(&warm, "15:00")),
            (false, "day_comfortable".to_string())
        );
    }

    #[test]
    fn unavailable_room_sensor_reads_as_zero() {
        let template = Template::compile(DEFAULT_TEMPLATE).unwrap();
        let states = states("unavailable", 5.0);
        assert_eq!(
            mode_of(&template, &context(&states, "10:00")),
            (true, "day_heating".to_string())
        );
    }

    #[test]
    fn bindings_arithmetic_and_functions() {
        let template = Template::compile(
            "let a = 2 * (3 + 4); # fourteen\n let b = max(a, 20) - min(1, 2);\n b / 2",
        )
        .unwrap();
        let states = HashMap::new();
        let value = template.evaluate(&context(&states, "10:00")).unwrap();
        assert_eq!(value.as_f64(), Some(9.5));
    }

    #[test]
    fn is_state_and_string_concat() {
        let template = Template::compile(
            "if is_state('sensor.room', '19.5') then 'room ' + states('sensor.room') else 'nope'",
        )
        .unwrap();
        let states = states("19.5", 0.0);
        assert_eq!(
            template.render(&context(&states, "10:00")).unwrap(),
            "room 19.5"
        );
    }

    #[test]
    fn compile_errors_are_reported() {
        assert!(matches!(
            Template::compile("if room < then 1 else 2"),
            Err(TemplateError::Syntax { .. })
        ));
        assert_eq!(
            Template::compile("now()"),
            Err(TemplateError::UnknownFunction("now".to_string()))
        );
        assert_eq!(
            Template::compile("abs(1, 2)"),
            Err(TemplateError::Arity {
                function: "abs",
                expected: "1",
                got: 2
            })
        );
        assert!(matches!(
            Template::compile("'open"),
            Err(TemplateError::Syntax { offset: 0, .. })
        ));
    }

    #[test]
    fn evaluation_errors_are_reported() {
        let states = HashMap::new();
        let context = context(&states, "10:00");

        let undefined = Template::compile("missing + 1").unwrap();
        assert_eq!(
            undefined.evaluate(&context),
            Err(TemplateError::UndefinedVariable("missing".to_string()))
        );

        let divide = Template::compile("1 / 0").unwrap();
        assert_eq!(divide.evaluate(&context), Err(TemplateError::DivisionByZero));

        let mixed = Template::compile("'a' < 1").unwrap();
        assert!(matches!(mixed.evaluate(&context), Err(TemplateError::Type(_))));
    }

    #[test]
    fn output_interpretation() {
        assert_eq!(interpret_output(" On "), Interpreted::Flag(true));
        assert_eq!(interpret_output("0"), Interpreted::Flag(false));
        assert_eq!(interpret_output("heating please"), Interpreted::Flag(true));
        assert_eq!(interpret_output(""), Interpreted::Flag(false));
        assert_eq!(interpret_output("{not json"), Interpreted::Flag(true));

        let Interpreted::Object(map) = interpret_output(r#"{"active": true, "target_temp": 21}"#)
        else {
            panic!("expected an object");
        };
        assert_eq!(map["target_temp"], Value::from(21));
    }

    #[test]
    fn rendering_rules() {
        assert_eq!(render_value(&Value::Null), "");
        assert_eq!(render_value(&Value::from("x")), "x");
        assert_eq!(render_value(&Value::Bool(false)), "false");
        let mut map = Map::new();
        map.insert("active".to_string(), Value::Bool(true));
        assert_eq!(render_value(&Value::Object(map)), r#"{"active":true}"#);
    }
}
