//! A small hand-written CEL-like expression parser and tree-walking
//! evaluator (§4.6 "Expression evaluation"). There is no existing CEL crate
//! in the corpus this workspace was grown from, so the grammar here covers
//! only what the directive language actually needs: literals, identifiers,
//! member/index access, unary/binary operators and list literals — not the
//! full CEL macro/function-call surface.

use std::fmt;

use smol_str::SmolStr;
use snapsql_core::value::Value;
use snapsql_core::IndexMap;

#[derive(Debug, Clone)]
pub struct CelError(pub String);

impl fmt::Display for CelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The evaluation environment: top-level parameters plus the innermost-first
/// loop-variable scope chain (§4.6 "Parameter binding").
pub struct Env<'a> {
    pub params: &'a IndexMap<String, Value>,
    pub scope: &'a [(String, Value)],
}

impl Env<'_> {
    pub fn resolve(&self, name: &str) -> Value {
        for (bound_name, value) in self.scope.iter().rev() {
            if bound_name == name {
                return value.clone();
            }
        }
        if name == "params" {
            return Value::Map(self.params.clone());
        }
        self.params.get(name).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
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
enum UnOp {
    Not,
    Neg,
}

#[derive(Debug, Clone)]
enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    Ident(SmolStr),
    List(Vec<Expr>),
    Member(Box<Expr>, SmolStr),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// A compiled expression, produced once per CEL-expression-pool entry and
/// cached for the evaluator's lifetime (§4.6 "Expression evaluation").
#[derive(Debug, Clone)]
pub struct Program {
    root: Expr,
}

pub fn compile(source: &str) -> Result<Program, CelError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(Program { root: expr })
}

impl Program {
    pub fn eval(&self, env: &Env) -> Result<Value, CelError> {
        eval_expr(&self.root, env)
    }
}

// --- Lexer -----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(SmolStr),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    Punct(&'static str),
    Eof,
}

fn lex(src: &str) -> Result<Vec<Tok>, CelError> {
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut out = Vec::new();
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i] as char == '_' || (bytes[i] as char).is_ascii_alphanumeric()) {
                i += 1;
            }
            let word = &src[start..i];
            out.push(Tok::Ident(SmolStr::new(word)));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] as char == '.' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
            }
            let text = &src[start..i];
            if is_float {
                out.push(Tok::Float(text.parse().map_err(|_| CelError(format!("invalid number `{text}`")))?));
            } else {
                out.push(Tok::Int(text.parse().map_err(|_| CelError(format!("invalid number `{text}`")))?));
            }
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            let start = i;
            i += 1;
            let mut value = String::new();
            loop {
                if i >= bytes.len() {
                    return Err(CelError(format!("unterminated string literal starting at byte {start}")));
                }
                let ch = bytes[i] as char;
                if ch == quote {
                    i += 1;
                    break;
                }
                if ch == '\\' && i + 1 < bytes.len() {
                    value.push(bytes[i + 1] as char);
                    i += 2;
                    continue;
                }
                value.push(ch);
                i += 1;
            }
            out.push(Tok::Str(SmolStr::new(value)));
            continue;
        }
        let two = if i + 1 < bytes.len() { &src[i..i + 2] } else { "" };
        if matches!(two, "==" | "!=" | "<=" | ">=" | "&&" | "||") {
            out.push(Tok::Punct(match two {
                "==" => "==",
                "!=" => "!=",
                "<=" => "<=",
                ">=" => ">=",
                "&&" => "&&",
                _ => "||",
            }));
            i += 2;
            continue;
        }
        let one = match c {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '.' => ".",
            ',' => ",",
            '!' => "!",
            '-' => "-",
            '+' => "+",
            '*' => "*",
            '/' => "/",
            '<' => "<",
            '>' => ">",
            _ => return Err(CelError(format!("unexpected character `{c}`"))),
        };
        out.push(Tok::Punct(one));
        i += 1;
    }
    out.push(Tok::Eof);
    Ok(out)
}

// --- Parser (precedence climbing) ------------------------------------------

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Tok {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect_punct(&mut self, p: &'static str) -> Result<(), CelError> {
        match self.bump() {
            Tok::Punct(found) if found == p => Ok(()),
            other => Err(CelError(format!("expected `{p}`, found {other:?}"))),
        }
    }

    fn expect_end(&self) -> Result<(), CelError> {
        match self.peek() {
            Tok::Eof => Ok(()),
            other => Err(CelError(format!("unexpected trailing token {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CelError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Tok::Punct("||")) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Tok::Punct("&&")) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("==") => BinOp::Eq,
                Tok::Punct("!=") => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("<") => BinOp::Lt,
                Tok::Punct("<=") => BinOp::Le,
                Tok::Punct(">") => BinOp::Gt,
                Tok::Punct(">=") => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("+") => BinOp::Add,
                Tok::Punct("-") => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CelError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Tok::Punct("*") => BinOp::Mul,
                Tok::Punct("/") => BinOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CelError> {
        match self.peek() {
            Tok::Punct("!") => {
                self.bump();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Tok::Punct("-") => {
                self.bump();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, CelError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Punct(".") => {
                    self.bump();
                    let name = match self.bump() {
                        Tok::Ident(name) => name,
                        other => return Err(CelError(format!("expected field name after `.`, found {other:?}"))),
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Tok::Punct("[") => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect_punct("]")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CelError> {
        match self.bump() {
            Tok::Int(v) => Ok(Expr::Int(v)),
            Tok::Float(v) => Ok(Expr::Float(v)),
            Tok::Str(v) => Ok(Expr::Str(v)),
            Tok::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => Ok(Expr::Ident(name)),
            },
            Tok::Punct("(") => {
                let inner = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Tok::Punct("[") => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::Punct("]")) {
                    loop {
                        items.push(self.parse_expr()?);
                        if matches!(self.peek(), Tok::Punct(",")) {
                            self.bump();
                            continue;
                        }
                        break;
                    }
                }
                self.expect_punct("]")?;
                Ok(Expr::List(items))
            }
            other => Err(CelError(format!("unexpected token {other:?}"))),
        }
    }
}

// --- Evaluator ---------------------------------------------------------------

fn eval_expr(expr: &Expr, env: &Env) -> Result<Value, CelError> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Int(*i)),
        Expr::Float(f) => Ok(Value::Float(*f)),
        Expr::Str(s) => Ok(Value::String(s.to_string())),
        Expr::Ident(name) => Ok(env.resolve(name)),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval_expr(item, env)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Member(base, field) => {
            let base_value = eval_expr(base, env)?;
            match base_value {
                Value::Map(map) => Ok(map.get(field.as_str()).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(CelError(format!("cannot access field `{field}` on {}", other.type_name()))),
            }
        }
        Expr::Index(base, index) => {
            let base_value = eval_expr(base, env)?;
            let index_value = eval_expr(index, env)?;
            match (base_value, index_value) {
                (Value::Array(items), Value::Int(idx)) => {
                    let idx = usize::try_from(idx).map_err(|_| CelError("negative index".to_string()))?;
                    Ok(items.get(idx).cloned().unwrap_or(Value::Null))
                }
                (Value::Map(map), Value::String(key)) => Ok(map.get(&key).cloned().unwrap_or(Value::Null)),
                (other, _) => Err(CelError(format!("cannot index into {}", other.type_name()))),
            }
        }
        Expr::Unary(UnOp::Not, inner) => Ok(Value::Bool(!eval_expr(inner, env)?.to_bool())),
        Expr::Unary(UnOp::Neg, inner) => match eval_expr(inner, env)? {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(CelError(format!("cannot negate {}", other.type_name()))),
        },
        Expr::Binary(BinOp::And, lhs, rhs) => {
            let l = eval_expr(lhs, env)?;
            if !l.to_bool() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_expr(rhs, env)?.to_bool()))
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            let l = eval_expr(lhs, env)?;
            if l.to_bool() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_expr(rhs, env)?.to_bool()))
        }
        Expr::Binary(BinOp::Eq, lhs, rhs) => Ok(Value::Bool(values_equal(&eval_expr(lhs, env)?, &eval_expr(rhs, env)?))),
        Expr::Binary(BinOp::Ne, lhs, rhs) => Ok(Value::Bool(!values_equal(&eval_expr(lhs, env)?, &eval_expr(rhs, env)?))),
        Expr::Binary(op @ (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge), lhs, rhs) => {
            let l = as_f64(&eval_expr(lhs, env)?)?;
            let r = as_f64(&eval_expr(rhs, env)?)?;
            Ok(Value::Bool(match op {
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!(),
            }))
        }
        Expr::Binary(op @ (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div), lhs, rhs) => {
            arithmetic(*op, &eval_expr(lhs, env)?, &eval_expr(rhs, env)?)
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => a == b,
    }
}

fn as_f64(v: &Value) -> Result<f64, CelError> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(CelError(format!("expected a number, found {}", other.type_name()))),
    }
}

fn arithmetic(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, CelError> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        if op == BinOp::Add {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }
    if matches!(lhs, Value::Int(_)) && matches!(rhs, Value::Int(_)) {
        let (Value::Int(a), Value::Int(b)) = (lhs, rhs) else { unreachable!() };
        return Ok(Value::Int(match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a.checked_div(*b).ok_or_else(|| CelError("division by zero".to_string()))?,
            _ => unreachable!(),
        }));
    }
    let a = as_f64(lhs)?;
    let b = as_f64(rhs)?;
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => unreachable!(),
    }))
}
