//! Formulas map an expression string to a live numeric value of the event record.
//!
//! A formula is compiled once, when a histogram is created or re-gated, and evaluated for
//! every buffer. Compilation tries, in order:
//!
//! 1. a field path, optionally prefixed by the branch name (`evt.tof.ch[2]`)
//! 2. a numeric constant (`1`, `-2.5e3`, `0x1f`)
//! 3. a bare top-level field name
//! 4. a general expression (`sqrt(adc[0]^2 + adc[1]^2) > 100 && trigger`)
//!
//! The first three compile to a single read or constant. Only the last builds a syntax tree.
use super::error::FormulaError;
use super::resolver::{resolve, resolve_in_branch, FieldHandle, VECTOR_ELEMENT_SUFFIX};
use super::schema::{Record, RecordSchema, RecordView};
use super::sync_cell::SynchronizedCell;

/// Value of a field read that has no value this cycle, e.g. a vector element past the end
pub const MISSING_VALUE: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Negate,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    Power,
    Multiply,
    Divide,
    Remainder,
    Add,
    Subtract,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    BitAnd,
    BitOr,
    And,
    Or,
}

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl BinaryOp {
    /// Left and right binding power. Higher binds tighter.
    fn binding_power(self) -> (u8, u8) {
        match self {
            BinaryOp::Or => (1, 2),
            BinaryOp::And => (3, 4),
            BinaryOp::BitOr => (5, 6),
            BinaryOp::BitAnd => (7, 8),
            BinaryOp::Equal | BinaryOp::NotEqual => (9, 10),
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
                (11, 12)
            }
            BinaryOp::Add | BinaryOp::Subtract => (13, 14),
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Remainder => (15, 16),
            // right associative, and tighter than unary minus
            BinaryOp::Power => (20, 19),
        }
    }

    fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "^" | "**" => BinaryOp::Power,
            "*" => BinaryOp::Multiply,
            "/" => BinaryOp::Divide,
            "%" => BinaryOp::Remainder,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Subtract,
            "<" => BinaryOp::Less,
            "<=" => BinaryOp::LessEqual,
            ">" => BinaryOp::Greater,
            ">=" => BinaryOp::GreaterEqual,
            "==" => BinaryOp::Equal,
            "!=" => BinaryOp::NotEqual,
            "&" => BinaryOp::BitAnd,
            "|" => BinaryOp::BitOr,
            "&&" => BinaryOp::And,
            "||" => BinaryOp::Or,
            _ => return None,
        })
    }

    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Power => lhs.powf(rhs),
            BinaryOp::Multiply => lhs * rhs,
            BinaryOp::Divide => lhs / rhs,
            BinaryOp::Remainder => lhs % rhs,
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Subtract => lhs - rhs,
            BinaryOp::Less => truth(lhs < rhs),
            BinaryOp::LessEqual => truth(lhs <= rhs),
            BinaryOp::Greater => truth(lhs > rhs),
            BinaryOp::GreaterEqual => truth(lhs >= rhs),
            BinaryOp::Equal => truth(lhs == rhs),
            BinaryOp::NotEqual => truth(lhs != rhs),
            BinaryOp::BitAnd => ((lhs as i64) & (rhs as i64)) as f64,
            BinaryOp::BitOr => ((lhs as i64) | (rhs as i64)) as f64,
            BinaryOp::And => truth(lhs != 0.0 && rhs != 0.0),
            BinaryOp::Or => truth(lhs != 0.0 || rhs != 0.0),
        }
    }
}

const PREFIX_BINDING_POWER: u8 = 17;

/// Deepest nesting of parentheses, prefix operators and right-associative powers
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Sqrt,
    Abs,
    Exp,
    Log,
    Log10,
    Sin,
    Cos,
    Tan,
    Atan2,
    Pow,
    Min,
    Max,
    Floor,
    Ceil,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "log10" => Function::Log10,
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "atan2" => Function::Atan2,
            "pow" => Function::Pow,
            "min" => Function::Min,
            "max" => Function::Max,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Function::Atan2 | Function::Pow | Function::Min | Function::Max => 2,
            _ => 1,
        }
    }

    fn apply(self, args: &[f64]) -> f64 {
        let x = args[0];
        match self {
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Log10 => x.log10(),
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Floor => x.floor(),
            Function::Ceil => x.ceil(),
            Function::Atan2 => x.atan2(args[1]),
            Function::Pow => x.powf(args[1]),
            Function::Min => x.min(args[1]),
            Function::Max => x.max(args[1]),
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Variable(FieldHandle),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    fn eval(&self, view: &RecordView<'_>) -> f64 {
        match self {
            Expr::Number(value) => *value,
            Expr::Variable(handle) => handle.read(view).unwrap_or(MISSING_VALUE),
            Expr::Unary(op, operand) => {
                let value = operand.eval(view);
                match op {
                    UnaryOp::Negate => -value,
                    UnaryOp::Plus => value,
                    UnaryOp::Not => truth(value == 0.0),
                }
            }
            Expr::Binary(op, lhs, rhs) => op.apply(lhs.eval(view), rhs.eval(view)),
            Expr::Call(function, args) => {
                let values: Vec<f64> = args.iter().map(|arg| arg.eval(view)).collect();
                function.apply(&values)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: [&str; 17] = [
    "**", "<=", ">=", "==", "!=", "&&", "||", "^", "*", "/", "%", "+", "-", "<", ">", "&", "|",
];

fn parse_number(text: &str) -> Option<f64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"));
    match digits {
        Some(hex) => u64::from_str_radix(hex, 16).ok().map(|v| v as f64),
        None => {
            // f64::from_str also accepts "inf" and "nan", which are field names here
            let unsigned = text
                .strip_prefix(|c: char| c == '+' || c == '-')
                .unwrap_or(text);
            if unsigned.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
                text.parse::<f64>().ok()
            } else {
                None
            }
        }
    }
}

fn lex(expression: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        if c.is_whitespace() {
            pos += 1;
        } else if c.is_ascii_digit()
            || (c == '.' && chars.get(pos + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = pos;
            if c == '0' && matches!(chars.get(pos + 1), Some('x') | Some('X')) {
                pos += 2;
                while pos < chars.len() && chars[pos].is_ascii_hexdigit() {
                    pos += 1;
                }
            } else {
                while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                    pos += 1;
                }
                if matches!(chars.get(pos), Some('e') | Some('E')) {
                    let mut exp = pos + 1;
                    if matches!(chars.get(exp), Some('+') | Some('-')) {
                        exp += 1;
                    }
                    if chars.get(exp).is_some_and(|n| n.is_ascii_digit()) {
                        pos = exp;
                        while pos < chars.len() && chars[pos].is_ascii_digit() {
                            pos += 1;
                        }
                    }
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let value = parse_number(&text).ok_or(format!("invalid number \"{text}\""))?;
            tokens.push(Token::Number(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = pos;
            while pos < chars.len() {
                let n = chars[pos];
                if n.is_ascii_alphanumeric() || n == '_' || n == '.' {
                    pos += 1;
                } else if n == '[' {
                    while pos < chars.len() && chars[pos] != ']' {
                        pos += 1;
                    }
                    if pos == chars.len() {
                        return Err("unclosed '['".to_string());
                    }
                    pos += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token::Name(chars[start..pos].iter().collect()));
        } else if c == '(' {
            tokens.push(Token::LParen);
            pos += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            pos += 1;
        } else if c == ',' {
            tokens.push(Token::Comma);
            pos += 1;
        } else if c == '!' && chars.get(pos + 1) != Some(&'=') {
            tokens.push(Token::Op("!"));
            pos += 1;
        } else {
            let rest: String = chars[pos..chars.len().min(pos + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(**op))
                .ok_or(format!("unexpected character '{c}'"))?;
            tokens.push(Token::Op(*op));
            pos += op.len();
        }
    }
    Ok(tokens)
}

/// Pratt parser over the token stream. Variables are handed to `resolve_variable` one at a
/// time as they are encountered.
struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    resolve_variable: &'a mut dyn FnMut(&str) -> Option<FieldHandle>,
}

impl<'a> Parser<'a> {
    fn parse_error(&self, reason: impl Into<String>) -> FormulaError {
        FormulaError::Parse {
            expression: self.expression.to_string(),
            reason: reason.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, expected: Token) -> Result<(), FormulaError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(self.parse_error(format!("expected {expected:?}, found {token:?}"))),
            None => Err(self.parse_error(format!("expected {expected:?} at end of expression"))),
        }
    }

    fn parse(mut self) -> Result<Expr, FormulaError> {
        let expr = self.expr(0)?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(self.parse_error(format!("unexpected trailing {token:?}"))),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, FormulaError> {
        let function = Function::from_name(name).ok_or_else(|| FormulaError::UnknownFunction {
            expression: self.expression.to_string(),
            function: name.to_string(),
        })?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.expr(0)?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != function.arity() {
            return Err(FormulaError::BadArgumentCount {
                function: name.to_string(),
                expected: function.arity(),
                found: args.len(),
            });
        }
        Ok(Expr::Call(function, args))
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, FormulaError> {
        if self.depth >= MAX_NESTING {
            return Err(self.parse_error(format!("nested deeper than {MAX_NESTING} levels")));
        }
        self.depth += 1;
        let expr = self.expr_at_depth(min_bp);
        self.depth -= 1;
        expr
    }

    fn expr_at_depth(&mut self, min_bp: u8) -> Result<Expr, FormulaError> {
        let mut lhs = match self.next() {
            Some(Token::Number(value)) => Expr::Number(value),
            Some(Token::Name(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.call(&name)?
                } else if let Some(handle) = (self.resolve_variable)(&name) {
                    Expr::Variable(handle)
                } else {
                    return Err(FormulaError::UnknownVariable {
                        expression: self.expression.to_string(),
                        variable: name,
                    });
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr(0)?;
                self.expect(Token::RParen)?;
                inner
            }
            Some(Token::Op(symbol)) => {
                let op = match symbol {
                    "-" => UnaryOp::Negate,
                    "+" => UnaryOp::Plus,
                    "!" => UnaryOp::Not,
                    _ => return Err(self.parse_error(format!("unexpected operator '{symbol}'"))),
                };
                let operand = self.expr(PREFIX_BINDING_POWER)?;
                Expr::Unary(op, Box::new(operand))
            }
            Some(token) => return Err(self.parse_error(format!("unexpected {token:?}"))),
            None => return Err(self.parse_error("unexpected end of expression")),
        };

        loop {
            let symbol = match self.peek() {
                Some(Token::Op(symbol)) => *symbol,
                _ => break,
            };
            let op = BinaryOp::from_symbol(symbol)
                .ok_or_else(|| self.parse_error(format!("'{symbol}' is not a binary operator")))?;
            let (left_bp, right_bp) = op.binding_power();
            if left_bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(right_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
}

#[derive(Debug, Clone)]
enum Term {
    Field(FieldHandle),
    Constant(f64),
    Expression(Expr),
}

/// One compiled parameter or gate expression bound to a record schema
#[derive(Debug, Clone)]
pub struct FormulaEngine {
    branch: String,
    schema: &'static RecordSchema,
    expression: String,
    term: Term,
}

impl FormulaEngine {
    /// Compile `expression` against `schema`. `branch` is the name of the event type, which may
    /// prefix field paths. A blank expression means `1`.
    pub fn new(
        branch: &str,
        schema: &'static RecordSchema,
        expression: &str,
    ) -> Result<Self, FormulaError> {
        let expression = normalize(expression);
        let term = compile(branch, schema, &expression)?;
        Ok(Self {
            branch: branch.to_string(),
            schema,
            expression,
            term,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    #[cfg(test)]
    fn is_constant(&self) -> bool {
        matches!(self.term, Term::Constant(_))
    }

    /// Evaluate against a view borrowed from an already held data lock
    pub fn evaluate(&self, view: &RecordView<'_>) -> f64 {
        match &self.term {
            Term::Field(handle) => handle.read(view).unwrap_or(MISSING_VALUE),
            Term::Constant(value) => *value,
            Term::Expression(expr) => expr.eval(view),
        }
    }

    /// Acquire the data lock, then evaluate
    pub fn evaluate_locking<R: Record>(&self, cell: &SynchronizedCell<R>) -> f64 {
        let record = cell.lock();
        self.evaluate(&RecordView::new(&*record))
    }

    /// Replace the expression. The old one stays in effect if the new one does not compile.
    pub fn change_expression(&mut self, expression: &str) -> Result<(), FormulaError> {
        let expression = normalize(expression);
        let term = compile(&self.branch, self.schema, &expression)?;
        self.expression = expression;
        self.term = term;
        Ok(())
    }
}

fn normalize(expression: &str) -> String {
    let stripped: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if stripped.is_empty() {
        String::from("1")
    } else {
        stripped
    }
}

fn compile(
    branch: &str,
    schema: &'static RecordSchema,
    expression: &str,
) -> Result<Term, FormulaError> {
    let is_path = expression.contains(|c: char| c == '.' || c == '[')
        || expression.contains(VECTOR_ELEMENT_SUFFIX);
    if is_path {
        if let Ok(handle) = resolve_in_branch(branch, schema, expression) {
            return Ok(Term::Field(handle));
        }
    }

    if let Some(value) = parse_number(expression) {
        return Ok(Term::Constant(value));
    }

    if schema.field(expression).is_some() {
        if let Ok(handle) = resolve(schema, expression) {
            return Ok(Term::Field(handle));
        }
    }

    let tokens = lex(expression).map_err(|reason| FormulaError::Parse {
        expression: expression.to_string(),
        reason,
    })?;
    let mut resolve_variable = |name: &str| resolve_in_branch(branch, schema, name).ok();
    let parser = Parser {
        expression,
        tokens,
        pos: 0,
        depth: 0,
        resolve_variable: &mut resolve_variable,
    };
    Ok(Term::Expression(parser.parse()?))
}
