//! Hand-written recursive descent parser.
//!
//! Statements are parsed top-down; binary arithmetic uses a small Pratt
//! loop with binding powers. Constructs outside the restricted language
//! (imports, classes, exception handling, generators, async, global
//! declarations) are rejected here with a compile fault.

use super::ast::*;
use super::error::Fault;
use super::lexer::{tokenize, unescape, Spanned, StrLit, Token};

type PResult<T> = Result<T, Fault>;

const MAX_NESTING: usize = 64;

/// Parse a whole program.
pub fn parse(source: &str) -> PResult<Module> {
    let tokens = tokenize(source)?;
    Parser::new(tokens, 0).parse_module()
}

/// Parse a standalone expression (f-string fields). `line` is the line of
/// the enclosing literal.
pub fn parse_expression(source: &str, line: u32) -> PResult<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens, line.saturating_sub(1));
    let expr = parser.parse_expr()?;
    while matches!(parser.peek(), Token::Newline(_)) {
        parser.advance();
    }
    if !matches!(parser.peek(), Token::Eof) {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    line_offset: u32,
}

fn forbidden(token: &Token) -> Option<&'static str> {
    Some(match token {
        Token::Import | Token::From => "import statements are not allowed",
        Token::Class => "class definitions are not allowed",
        Token::Try | Token::Except | Token::Finally | Token::Raise => {
            "exception handling is not supported"
        }
        Token::With => "'with' statements are not supported",
        Token::Yield => "generators are not supported",
        Token::Async | Token::Await => "async code is not supported",
        Token::Global | Token::Nonlocal => "global and nonlocal declarations are not supported",
        _ => return None,
    })
}

fn aug_op(token: &Token) -> Option<BinOp> {
    Some(match token {
        Token::PlusAssign => BinOp::Add,
        Token::MinusAssign => BinOp::Sub,
        Token::StarAssign => BinOp::Mul,
        Token::SlashAssign => BinOp::Div,
        Token::DoubleSlashAssign => BinOp::FloorDiv,
        Token::PercentAssign => BinOp::Mod,
        Token::DoubleStarAssign => BinOp::Pow,
        _ => return None,
    })
}

/// Binding powers for the Pratt loop: `(left, right)`.
fn infix_binding(token: &Token) -> Option<(BinOp, u8, u8)> {
    Some(match token {
        Token::Plus => (BinOp::Add, 10, 11),
        Token::Minus => (BinOp::Sub, 10, 11),
        Token::Star => (BinOp::Mul, 20, 21),
        Token::Slash => (BinOp::Div, 20, 21),
        Token::DoubleSlash => (BinOp::FloorDiv, 20, 21),
        Token::Percent => (BinOp::Mod, 20, 21),
        _ => return None,
    })
}

impl Parser {
    fn new(tokens: Vec<Spanned>, line_offset: u32) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            line_offset,
        }
    }

    // -- token stream --------------------------------------------------------

    fn peek(&self) -> &Token {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        self.tokens
            .get((self.pos + n).min(last))
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn line(&self) -> u32 {
        let last = self.tokens.len().saturating_sub(1);
        self.tokens
            .get(self.pos.min(last))
            .map(|s| s.line)
            .unwrap_or(1)
            + self.line_offset
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, expected: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(expected)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> PResult<()> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected {what}, found {}",
                self.peek().describe()
            )))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected {what}, found {}", other.describe()))),
        }
    }

    fn error(&self, message: impl Into<String>) -> Fault {
        Fault::compile(message, self.line())
    }

    fn unexpected(&self) -> Fault {
        match forbidden(self.peek()) {
            Some(message) => self.error(message),
            None => self.error(format!("invalid syntax near {}", self.peek().describe())),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("program is nested too deeply"));
        }
        let result = f(self);
        self.depth -= 1;
        result
    }

    // -- statements ----------------------------------------------------------

    fn parse_module(mut self) -> PResult<Module> {
        let mut body = Vec::new();
        while matches!(self.peek(), Token::Newline(_)) {
            self.advance();
        }
        while !self.check(&Token::Eof) {
            body.extend(self.parse_statement()?);
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> PResult<Vec<Stmt>> {
        self.nested(|p| {
            let line = p.line();
            match p.peek().clone() {
                Token::If => Ok(vec![p.parse_if()?]),
                Token::While => {
                    p.advance();
                    let test = p.parse_expr()?;
                    let body = p.parse_suite()?;
                    if p.check(&Token::Else) {
                        return Err(p.error("'else' on loops is not supported"));
                    }
                    Ok(vec![Stmt::new(StmtKind::While { test, body }, line)])
                }
                Token::For => {
                    p.advance();
                    let target = p.parse_target_list()?;
                    p.expect(Token::In, "'in'")?;
                    let iter = p.parse_testlist()?;
                    let body = p.parse_suite()?;
                    if p.check(&Token::Else) {
                        return Err(p.error("'else' on loops is not supported"));
                    }
                    Ok(vec![Stmt::new(StmtKind::For { target, iter, body }, line)])
                }
                Token::Def => Ok(vec![p.parse_def()?]),
                Token::Indent => Err(p.error("unexpected indent")),
                token if forbidden(&token).is_some() => Err(p.unexpected()),
                _ => p.parse_simple_line(),
            }
        })
    }

    fn parse_simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.parse_small()?];
        while self.eat(&Token::Semicolon) {
            if matches!(self.peek(), Token::Newline(_)) {
                break;
            }
            stmts.push(self.parse_small()?);
        }
        if !matches!(self.peek(), Token::Newline(_)) {
            return Err(self.unexpected());
        }
        self.advance();
        Ok(stmts)
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), Token::Newline(_) | Token::Semicolon | Token::Eof)
    }

    fn parse_small(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::Pass => {
                self.advance();
                StmtKind::Pass
            }
            Token::Break => {
                self.advance();
                StmtKind::Break
            }
            Token::Continue => {
                self.advance();
                StmtKind::Continue
            }
            Token::Return => {
                self.advance();
                if self.at_line_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.parse_testlist()?))
                }
            }
            Token::Del => {
                self.advance();
                let first = self.parse_postfix_checked()?;
                let mut targets = vec![self.to_target(first)?];
                while self.eat(&Token::Comma) {
                    let next = self.parse_postfix_checked()?;
                    targets.push(self.to_target(next)?);
                }
                for target in &targets {
                    if !matches!(target, Target::Subscript { .. }) {
                        return Err(Fault::compile(
                            "only subscripts can be deleted (del x[key])",
                            line,
                        ));
                    }
                }
                StmtKind::Delete(targets)
            }
            Token::Assert => {
                self.advance();
                let test = self.parse_expr()?;
                let message = if self.eat(&Token::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                StmtKind::Assert { test, message }
            }
            token if forbidden(&token).is_some() => return Err(self.unexpected()),
            _ => return self.parse_expr_statement(),
        };
        Ok(Stmt::new(kind, line))
    }

    fn parse_postfix_checked(&mut self) -> PResult<Expr> {
        self.nested(|p| p.parse_postfix())
    }

    fn parse_expr_statement(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let first = self.parse_testlist()?;

        if self.check(&Token::Assign) {
            let mut targets = vec![self.to_target(first)?];
            loop {
                self.advance();
                let value = self.parse_testlist()?;
                if self.check(&Token::Assign) {
                    targets.push(self.to_target(value)?);
                } else {
                    return Ok(Stmt::new(StmtKind::Assign { targets, value }, line));
                }
            }
        }

        if let Some(op) = aug_op(self.peek()) {
            self.advance();
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(Fault::compile(
                    "illegal expression for augmented assignment",
                    line,
                ));
            }
            let value = self.parse_testlist()?;
            return Ok(Stmt::new(StmtKind::AugAssign { target, op, value }, line));
        }

        if self.check(&Token::Colon) && matches!(first.kind, ExprKind::Name(_)) {
            // Annotated assignment; the annotation is ignored.
            self.advance();
            self.parse_expr()?;
            if self.eat(&Token::Assign) {
                let target = self.to_target(first)?;
                let value = self.parse_testlist()?;
                return Ok(Stmt::new(
                    StmtKind::Assign {
                        targets: vec![target],
                        value,
                    },
                    line,
                ));
            }
            return Ok(Stmt::new(StmtKind::Pass, line));
        }

        Ok(Stmt::new(StmtKind::Expr(first), line))
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr.kind {
            ExprKind::Name(name) => Ok(Target::Name(name)),
            ExprKind::Subscript { value, index } => Ok(Target::Subscript { value, index }),
            ExprKind::Tuple(items) | ExprKind::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<PResult<_>>()?,
            )),
            ExprKind::Attribute { .. } => Err(Fault::compile(
                "attribute assignment is not supported",
                expr.line,
            )),
            _ => Err(Fault::compile("cannot assign to expression", expr.line)),
        }
    }

    fn parse_suite(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(Token::Colon, "':'")?;
        if !matches!(self.peek(), Token::Newline(_)) {
            return self.parse_simple_line();
        }
        self.advance();
        if !self.eat(&Token::Indent) {
            return Err(self.error("expected an indented block"));
        }
        let mut body = Vec::new();
        while !self.check(&Token::Dedent) && !self.check(&Token::Eof) {
            body.extend(self.parse_statement()?);
        }
        self.eat(&Token::Dedent);
        Ok(body)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance(); // `if` or `elif`
        let test = self.parse_expr()?;
        let body = self.parse_suite()?;
        let orelse = if self.check(&Token::Elif) {
            vec![self.parse_if()?]
        } else if self.eat(&Token::Else) {
            self.parse_suite()?
        } else {
            Vec::new()
        };
        Ok(Stmt::new(StmtKind::If { test, body, orelse }, line))
    }

    fn parse_def(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.advance();
        let name = self.expect_ident("function name")?;
        self.expect(Token::LParen, "'('")?;
        let params = self.parse_params(&Token::RParen)?;
        self.expect(Token::RParen, "')'")?;
        if self.eat(&Token::Arrow) {
            self.parse_expr()?;
        }
        let body = self.parse_suite()?;
        Ok(Stmt::new(StmtKind::FunctionDef { name, params, body }, line))
    }

    fn parse_params(&mut self, end: &Token) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.check(end) {
            if self.check(&Token::Star) || self.check(&Token::DoubleStar) {
                return Err(self.error("variadic parameters are not supported"));
            }
            let name = self.expect_ident("parameter name")?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!("duplicate argument '{name}'")));
            }
            // Annotations only appear in `def`, where the terminator is `)`.
            if *end == Token::RParen && self.eat(&Token::Colon) {
                self.parse_expr()?;
            }
            let default = if self.eat(&Token::Assign) {
                Some(self.parse_expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param { name, default });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(params)
    }

    /// Targets of `for` loops and comprehensions. Parsed below the
    /// comparison level so `in` is not consumed.
    fn parse_target_list(&mut self) -> PResult<Target> {
        let line = self.line();
        let first = self.parse_arith()?;
        if !self.check(&Token::Comma) {
            return self.to_target(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(&Token::In) {
                break;
            }
            items.push(self.parse_arith()?);
        }
        self.to_target(Expr::new(ExprKind::Tuple(items), line))
    }

    // -- expressions ---------------------------------------------------------

    /// Comma-separated expressions; more than one (or a trailing comma) makes a tuple.
    fn parse_testlist(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_expr()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.at_line_end() || self.check(&Token::Assign) || aug_op(self.peek()).is_some() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            if p.check(&Token::Lambda) {
                return p.parse_lambda();
            }
            let line = p.line();
            let body = p.parse_or()?;
            if !p.eat(&Token::If) {
                return Ok(body);
            }
            let test = p.parse_or()?;
            p.expect(Token::Else, "'else' in conditional expression")?;
            let orelse = p.parse_expr()?;
            Ok(Expr::new(
                ExprKind::IfElse {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                line,
            ))
        })
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.parse_params(&Token::Colon)?;
        self.expect(Token::Colon, "':' after lambda parameters")?;
        let body = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            line,
        ))
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            let line = self.line();
            self.advance();
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::Logical {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_not()?;
        while self.check(&Token::And) {
            let line = self.line();
            self.advance();
            let right = self.parse_not()?;
            left = Expr::new(
                ExprKind::Logical {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                line,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.check(&Token::Not) {
            let line = self.line();
            self.advance();
            let operand = self.nested(|p| p.parse_not())?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                line,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let next_is = |p: &Self, t: Token| *p.peek_nth(1) == t;
        let op = match self.peek().clone() {
            Token::EqEq => CmpOp::Eq,
            Token::NotEq => CmpOp::NotEq,
            Token::Lt => CmpOp::Lt,
            Token::LtEq => CmpOp::LtEq,
            Token::Gt => CmpOp::Gt,
            Token::GtEq => CmpOp::GtEq,
            Token::In => CmpOp::In,
            Token::Not if next_is(self, Token::In) => {
                self.advance();
                CmpOp::NotIn
            }
            Token::Is if next_is(self, Token::Not) => {
                self.advance();
                CmpOp::IsNot
            }
            Token::Is => CmpOp::Is,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let line = self.line();
        let left = self.parse_arith()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.parse_arith()?));
        }
        if rest.is_empty() {
            return Ok(left);
        }
        Ok(Expr::new(
            ExprKind::Compare {
                left: Box::new(left),
                rest,
            },
            line,
        ))
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_bp: u8) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, l_bp, r_bp)) = infix_binding(self.peek()) {
            if l_bp < min_bp {
                break;
            }
            let line = self.line();
            self.advance();
            let rhs = self.nested(|p| p.parse_binary(r_bp))?;
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(lhs),
                    right: Box::new(rhs),
                },
                line,
            );
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let op = match self.peek().clone() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        let line = self.line();
        self.advance();
        let operand = self.nested(|p| p.parse_unary())?;
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            line,
        ))
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_postfix()?;
        if !self.check(&Token::DoubleStar) {
            return Ok(base);
        }
        let line = self.line();
        self.advance();
        let exponent = self.nested(|p| p.parse_unary())?;
        Ok(Expr::new(
            ExprKind::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            },
            line,
        ))
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            let line = self.line();
            match self.peek().clone() {
                Token::LParen => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                            kwargs,
                        },
                        line,
                    );
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::new(
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                    );
                }
                Token::Dot => {
                    self.advance();
                    let name = self.expect_ident("attribute name")?;
                    expr = Expr::new(
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            name,
                        },
                        line,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> PResult<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check(&Token::RParen) {
            if self.check(&Token::Star) || self.check(&Token::DoubleStar) {
                return Err(self.error("argument unpacking is not supported"));
            }
            let keyword = match (self.peek(), self.peek_nth(1)) {
                (Token::Ident(name), Token::Assign) => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = keyword {
                self.advance();
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.parse_expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let line = self.line();
                let arg = self.parse_expr()?;
                if self.check(&Token::For) {
                    // Bare generator argument: evaluated eagerly as a list.
                    let generators = self.parse_comprehension_clauses()?;
                    args.push(Expr::new(
                        ExprKind::ListComp {
                            elt: Box::new(arg),
                            generators,
                        },
                        line,
                    ));
                } else {
                    args.push(arg);
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen, "')'")?;
        Ok((args, kwargs))
    }

    fn parse_subscript(&mut self) -> PResult<Expr> {
        let line = self.line();
        let first = self.parse_slice_item()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(&Token::RBracket) {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(Expr::new(ExprKind::Tuple(items), line))
    }

    fn parse_slice_item(&mut self) -> PResult<Expr> {
        let line = self.line();
        let lower = if self.check(&Token::Colon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        if !self.eat(&Token::Colon) {
            return lower.ok_or_else(|| self.error("expected subscript"));
        }
        let ends_part = |p: &Self| {
            p.check(&Token::Colon) || p.check(&Token::RBracket) || p.check(&Token::Comma)
        };
        let upper = if ends_part(self) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat(&Token::Colon) && !ends_part(self) {
            Some(Box::new(self.parse_expr()?))
        } else {
            None
        };
        Ok(Expr::new(
            ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
            line,
        ))
    }

    fn parse_comprehension_clauses(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat(&Token::For) {
            let target = self.parse_target_list()?;
            self.expect(Token::In, "'in'")?;
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.eat(&Token::If) {
                conditions.push(self.parse_or()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        let kind = match self.peek().clone() {
            Token::Int(i) => {
                self.advance();
                ExprKind::Int(i)
            }
            Token::Float(f) => {
                self.advance();
                ExprKind::Float(f)
            }
            Token::Str(_) => return self.parse_strings(),
            Token::None => {
                self.advance();
                ExprKind::None
            }
            Token::True => {
                self.advance();
                ExprKind::Bool(true)
            }
            Token::False => {
                self.advance();
                ExprKind::Bool(false)
            }
            Token::Ident(name) => {
                self.advance();
                ExprKind::Name(name)
            }
            Token::LParen => {
                self.advance();
                if self.eat(&Token::RParen) {
                    return Ok(Expr::new(ExprKind::Tuple(Vec::new()), line));
                }
                let first = self.parse_expr()?;
                if self.check(&Token::For) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::new(
                        ExprKind::ListComp {
                            elt: Box::new(first),
                            generators,
                        },
                        line,
                    ));
                }
                if self.eat(&Token::RParen) {
                    return Ok(first);
                }
                let items = self.parse_sequence_tail(first, &Token::RParen)?;
                ExprKind::Tuple(items)
            }
            Token::LBracket => {
                self.advance();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::new(ExprKind::List(Vec::new()), line));
                }
                let first = self.parse_expr()?;
                if self.check(&Token::For) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(Token::RBracket, "']'")?;
                    ExprKind::ListComp {
                        elt: Box::new(first),
                        generators,
                    }
                } else {
                    ExprKind::List(self.parse_sequence_tail(first, &Token::RBracket)?)
                }
            }
            Token::LBrace => {
                self.advance();
                return self.parse_brace(line);
            }
            _ => return Err(self.unexpected()),
        };
        Ok(Expr::new(kind, line))
    }

    /// Rest of a comma-separated display after its first item, through the closer.
    fn parse_sequence_tail(&mut self, first: Expr, close: &Token) -> PResult<Vec<Expr>> {
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(close) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        if !self.eat(close) {
            return Err(self.error(format!(
                "expected {}, found {}",
                close.describe(),
                self.peek().describe()
            )));
        }
        Ok(items)
    }

    fn parse_brace(&mut self, line: u32) -> PResult<Expr> {
        if self.eat(&Token::RBrace) {
            return Ok(Expr::new(ExprKind::Dict(Vec::new()), line));
        }
        if self.check(&Token::DoubleStar) {
            return Err(self.error("dict unpacking is not supported"));
        }
        let first = self.parse_expr()?;

        if !self.eat(&Token::Colon) {
            if self.check(&Token::For) {
                let generators = self.parse_comprehension_clauses()?;
                self.expect(Token::RBrace, "'}'")?;
                return Ok(Expr::new(
                    ExprKind::SetComp {
                        elt: Box::new(first),
                        generators,
                    },
                    line,
                ));
            }
            let items = self.parse_sequence_tail(first, &Token::RBrace)?;
            return Ok(Expr::new(ExprKind::Set(items), line));
        }

        let value = self.parse_expr()?;
        if self.check(&Token::For) {
            let generators = self.parse_comprehension_clauses()?;
            self.expect(Token::RBrace, "'}'")?;
            return Ok(Expr::new(
                ExprKind::DictComp {
                    key: Box::new(first),
                    value: Box::new(value),
                    generators,
                },
                line,
            ));
        }

        let mut pairs = vec![(first, value)];
        while self.eat(&Token::Comma) {
            if self.check(&Token::RBrace) {
                break;
            }
            let key = self.parse_expr()?;
            self.expect(Token::Colon, "':'")?;
            pairs.push((key, self.parse_expr()?));
        }
        self.expect(Token::RBrace, "'}'")?;
        Ok(Expr::new(ExprKind::Dict(pairs), line))
    }

    /// Adjacent string literals concatenate; any f-string makes the whole an f-string.
    fn parse_strings(&mut self) -> PResult<Expr> {
        let line = self.line();
        let mut literals: Vec<StrLit> = Vec::new();
        while let Token::Str(lit) = self.peek().clone() {
            self.advance();
            literals.push(lit);
        }

        if literals.iter().all(|l| !l.fstring) {
            let joined = literals.into_iter().map(|l| l.value).collect::<String>();
            return Ok(Expr::new(ExprKind::Str(joined), line));
        }

        let mut parts: Vec<FPart> = Vec::new();
        for lit in literals {
            if lit.fstring {
                parts.extend(parse_fstring(&lit.value, lit.raw, line)?);
            } else {
                parts.push(FPart::Literal(lit.value));
            }
        }
        Ok(Expr::new(ExprKind::FString(parts), line))
    }
}

/// Split an f-string body into literal segments and replacement fields.
fn parse_fstring(body: &str, raw: bool, line: u32) -> PResult<Vec<FPart>> {
    let literal = |s: &str| {
        if raw {
            s.to_string()
        } else {
            unescape(s)
        }
    };

    let mut parts = Vec::new();
    let mut text = String::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            text.push('{');
            i += 2;
            continue;
        }
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                text.push('}');
                i += 2;
                continue;
            }
            return Err(Fault::compile("f-string: single '}' is not allowed", line));
        }
        if c != '{' {
            text.push(c);
            i += 1;
            continue;
        }

        if !text.is_empty() {
            parts.push(FPart::Literal(literal(&text)));
            text.clear();
        }

        // Scan the replacement field, honouring nested brackets and quotes.
        let start = i + 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut expr_end: Option<usize> = None;
        let mut conversion: Option<char> = None;
        let mut spec_start: Option<usize> = None;
        let mut j = start;
        let close = loop {
            let Some(&ch) = chars.get(j) else {
                return Err(Fault::compile("f-string: expecting '}'", line));
            };
            if let Some(q) = quote {
                if ch == q {
                    quote = None;
                }
                j += 1;
                continue;
            }
            match ch {
                '\'' | '"' if spec_start.is_none() => quote = Some(ch),
                '(' | '[' | '{' if spec_start.is_none() => depth += 1,
                ')' | ']' if spec_start.is_none() => depth = depth.saturating_sub(1),
                '}' if depth > 0 && spec_start.is_none() => depth -= 1,
                '}' => break j,
                '{' => {
                    return Err(Fault::compile(
                        "f-string: nested replacement fields are not supported",
                        line,
                    ))
                }
                '!' if depth == 0
                    && spec_start.is_none()
                    && chars.get(j + 1) != Some(&'=') =>
                {
                    expr_end.get_or_insert(j);
                    let conv = chars.get(j + 1).copied();
                    match conv {
                        Some('r') | Some('s') | Some('a') => conversion = conv,
                        _ => {
                            return Err(Fault::compile(
                                "f-string: invalid conversion character",
                                line,
                            ))
                        }
                    }
                    j += 1;
                }
                ':' if depth == 0 && spec_start.is_none() => {
                    expr_end.get_or_insert(j);
                    spec_start = Some(j + 1);
                }
                _ => {}
            }
            j += 1;
        };

        let expr_text: String = chars[start..expr_end.unwrap_or(close)].iter().collect();
        if expr_text.trim().is_empty() {
            return Err(Fault::compile("f-string: empty expression not allowed", line));
        }
        let expr = parse_expression(expr_text.trim(), line)?;
        let spec = spec_start.map(|s| chars[s..close].iter().collect::<String>());
        parts.push(FPart::Field {
            expr,
            conversion,
            spec,
        });
        i = close + 1;
    }

    if !text.is_empty() {
        parts.push(FPart::Literal(literal(&text)));
    }
    Ok(parts)
}
