//! Recursive-descent parser for the Python-subset language.
//!
//! Grammar coverage matches the evaluator's node whitelist: expression
//! statements, assignments (chained, augmented, annotated, destructuring),
//! control flow, function definitions (sync and async), try/except, with,
//! imports, and the full expression grammar including comprehensions,
//! slices, f-strings, lambdas, and `await`. Anything outside the subset
//! (classes, decorators, `del`, star-imports) is rejected here, before any
//! code runs.

use std::sync::Arc;

use crate::interp::ast::*;
use crate::interp::lexer::{Lexer, Spanned, Token};
use crate::{Error, Result};

/// Parse a source string into a [`Program`].
pub fn parse(source: &str) -> Result<Program> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn parse_program(&mut self) -> Result<Program> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(&Token::EndOfFile) {
                break;
            }
            body.extend(self.parse_statement()?);
        }
        Ok(Program { body })
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, context: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(Error::parse(format!(
                "line {}: expected {:?} {}, found {:?}",
                self.line(),
                token,
                context,
                self.peek()
            )))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<String> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(Error::parse(format!(
                "line {}: expected identifier {}, found {:?}",
                self.line(),
                context,
                other
            ))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&Token::Newline) {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(format!("line {}: {}", self.line(), message.into()))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Vec<Stmt>> {
        match self.peek() {
            Token::KwIf => Ok(vec![self.parse_if()?]),
            Token::KwWhile => Ok(vec![self.parse_while()?]),
            Token::KwFor => Ok(vec![self.parse_for(false)?]),
            Token::KwDef => Ok(vec![self.parse_function_def(false)?]),
            Token::KwTry => Ok(vec![self.parse_try()?]),
            Token::KwWith => Ok(vec![self.parse_with(false)?]),
            Token::KwAsync => {
                self.advance();
                match self.peek() {
                    Token::KwDef => Ok(vec![self.parse_function_def(true)?]),
                    Token::KwFor => Ok(vec![self.parse_for(true)?]),
                    Token::KwWith => Ok(vec![self.parse_with(true)?]),
                    other => Err(self.error(format!(
                        "'async' must be followed by 'def', 'for', or 'with', found {other:?}"
                    ))),
                }
            }
            Token::Ident(name) if name == "class" => {
                Err(self.error("class definitions are not supported in this environment"))
            }
            Token::At => Err(self.error("decorators are not supported in this environment")),
            _ => self.parse_simple_stmt_line(),
        }
    }

    /// One physical line of `;`-separated simple statements.
    fn parse_simple_stmt_line(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = vec![self.parse_simple_stmt()?];
        while self.eat(&Token::Semicolon) {
            if self.check(&Token::Newline) || self.check(&Token::EndOfFile) {
                break;
            }
            stmts.push(self.parse_simple_stmt()?);
        }
        if !self.check(&Token::EndOfFile) && !self.check(&Token::Dedent) {
            self.expect(&Token::Newline, "after statement")?;
        }
        Ok(stmts)
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt> {
        match self.peek() {
            Token::KwReturn => {
                self.advance();
                if self.is_end_of_simple_stmt() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.parse_expr_list()?)))
                }
            }
            Token::KwBreak => {
                self.advance();
                Ok(Stmt::Break)
            }
            Token::KwContinue => {
                self.advance();
                Ok(Stmt::Continue)
            }
            Token::KwPass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            Token::KwRaise => {
                self.advance();
                if self.is_end_of_simple_stmt() {
                    Ok(Stmt::Raise(None))
                } else {
                    let exc = self.parse_expr()?;
                    // `raise X from Y` - the cause is accepted and dropped.
                    if self.eat(&Token::KwFrom) {
                        self.parse_expr()?;
                    }
                    Ok(Stmt::Raise(Some(exc)))
                }
            }
            Token::KwAssert => {
                self.advance();
                let condition = self.parse_expr()?;
                let message = if self.eat(&Token::Comma) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                Ok(Stmt::Assert { condition, message })
            }
            Token::KwImport => self.parse_import(),
            Token::KwFrom => self.parse_import_from(),
            Token::KwGlobal => {
                self.advance();
                let mut names = vec![self.expect_ident("after 'global'")?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_ident("in 'global' list")?);
                }
                Ok(Stmt::Global(names))
            }
            Token::KwNonlocal => {
                self.advance();
                let mut names = vec![self.expect_ident("after 'nonlocal'")?];
                while self.eat(&Token::Comma) {
                    names.push(self.expect_ident("in 'nonlocal' list")?);
                }
                Ok(Stmt::Nonlocal(names))
            }
            _ => self.parse_expr_or_assign(),
        }
    }

    fn is_end_of_simple_stmt(&self) -> bool {
        matches!(
            self.peek(),
            Token::Newline | Token::Semicolon | Token::EndOfFile | Token::Dedent
        )
    }

    fn parse_import(&mut self) -> Result<Stmt> {
        self.expect(&Token::KwImport, "")?;
        let mut modules = Vec::new();
        loop {
            let module = self.parse_dotted_name()?;
            let alias = if self.eat(&Token::KwAs) {
                Some(self.expect_ident("after 'as'")?)
            } else {
                None
            };
            modules.push((module, alias));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Stmt::Import(modules))
    }

    fn parse_import_from(&mut self) -> Result<Stmt> {
        self.expect(&Token::KwFrom, "")?;
        let module = self.parse_dotted_name()?;
        self.expect(&Token::KwImport, "in 'from' statement")?;
        if self.check(&Token::Star) {
            return Err(self.error("'from x import *' is not supported in this environment"));
        }
        let parenthesized = self.eat(&Token::LParen);
        let mut names = Vec::new();
        loop {
            let name = self.expect_ident("in import list")?;
            let alias = if self.eat(&Token::KwAs) {
                Some(self.expect_ident("after 'as'")?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat(&Token::Comma) {
                break;
            }
            if parenthesized && self.check(&Token::RParen) {
                break;
            }
        }
        if parenthesized {
            self.expect(&Token::RParen, "to close import list")?;
        }
        Ok(Stmt::ImportFrom { module, names })
    }

    fn parse_dotted_name(&mut self) -> Result<String> {
        let mut name = self.expect_ident("module name")?;
        while self.check(&Token::Dot) {
            self.advance();
            name.push('.');
            name.push_str(&self.expect_ident("after '.'")?);
        }
        Ok(name)
    }

    fn parse_expr_or_assign(&mut self) -> Result<Stmt> {
        let first = self.parse_target_or_expr_list()?;

        // Augmented assignment.
        let aug_op = match self.peek() {
            Token::PlusAssign => Some(BinOp::Add),
            Token::MinusAssign => Some(BinOp::Sub),
            Token::StarAssign => Some(BinOp::Mul),
            Token::SlashAssign => Some(BinOp::Div),
            Token::DoubleSlashAssign => Some(BinOp::FloorDiv),
            Token::PercentAssign => Some(BinOp::Mod),
            Token::DoubleStarAssign => Some(BinOp::Pow),
            Token::AmpAssign => Some(BinOp::BitAnd),
            Token::PipeAssign => Some(BinOp::BitOr),
            Token::CaretAssign => Some(BinOp::BitXor),
            Token::LShiftAssign => Some(BinOp::LShift),
            Token::RShiftAssign => Some(BinOp::RShift),
            _ => None,
        };
        if let Some(op) = aug_op {
            self.advance();
            let value = self.parse_expr_list()?;
            return Ok(Stmt::AugAssign {
                target: first,
                op,
                value,
            });
        }

        // Annotated assignment: `x: int = 5` (annotation discarded).
        if self.check(&Token::Colon) {
            self.advance();
            self.parse_expr()?;
            let value = if self.eat(&Token::Assign) {
                Some(self.parse_expr_list()?)
            } else {
                None
            };
            return Ok(Stmt::AnnAssign {
                target: first,
                value,
            });
        }

        // Chained assignment: `a = b = value`.
        if self.check(&Token::Assign) {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat(&Token::Assign) {
                let next = self.parse_target_or_expr_list()?;
                if self.check(&Token::Assign) {
                    targets.push(next);
                } else {
                    value = Some(next);
                }
            }
            let value = value.ok_or_else(|| self.error("missing right-hand side"))?;
            return Ok(Stmt::Assign { targets, value });
        }

        Ok(Stmt::Expr(first))
    }

    /// Comma-separated expressions that may serve as assignment targets
    /// (so starred elements are allowed). More than one → tuple.
    fn parse_target_or_expr_list(&mut self) -> Result<Expr> {
        let first = self.parse_expr_or_starred()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.is_end_of_simple_stmt() || self.check(&Token::Assign) {
                break;
            }
            items.push(self.parse_expr_or_starred()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_expr_or_starred(&mut self) -> Result<Expr> {
        if self.eat(&Token::Star) {
            Ok(Expr::Starred(Box::new(self.parse_expr()?)))
        } else {
            self.parse_expr()
        }
    }

    /// Comma-separated expressions → tuple when more than one.
    fn parse_expr_list(&mut self) -> Result<Expr> {
        let first = self.parse_expr()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.is_end_of_simple_stmt()
                || self.check(&Token::RParen)
                || self.check(&Token::RBracket)
                || self.check(&Token::Colon)
            {
                break;
            }
            items.push(self.parse_expr_or_starred()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.expect(&Token::KwIf, "")?;
        let mut branches = Vec::new();
        let condition = self.parse_expr()?;
        self.expect(&Token::Colon, "after 'if' condition")?;
        branches.push((condition, self.parse_block()?));

        let mut orelse = Vec::new();
        loop {
            self.skip_newlines_before_keyword(&[Token::KwElif, Token::KwElse]);
            if self.eat(&Token::KwElif) {
                let condition = self.parse_expr()?;
                self.expect(&Token::Colon, "after 'elif' condition")?;
                branches.push((condition, self.parse_block()?));
            } else if self.eat(&Token::KwElse) {
                self.expect(&Token::Colon, "after 'else'")?;
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    /// After a Dedent, elif/else/except/finally appear on the next logical
    /// line; nothing to skip in practice because blank lines were folded by
    /// the lexer, but a stray Newline between Dedent and the keyword is
    /// tolerated.
    fn skip_newlines_before_keyword(&mut self, keywords: &[Token]) {
        let mut lookahead = self.pos;
        while matches!(self.tokens[lookahead].token, Token::Newline) {
            lookahead += 1;
        }
        if keywords.iter().any(|k| self.tokens[lookahead].token == *k) {
            self.pos = lookahead;
        }
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.expect(&Token::KwWhile, "")?;
        let condition = self.parse_expr()?;
        self.expect(&Token::Colon, "after 'while' condition")?;
        let body = self.parse_block()?;
        Ok(Stmt::While { condition, body })
    }

    fn parse_for(&mut self, is_async: bool) -> Result<Stmt> {
        self.expect(&Token::KwFor, "")?;
        let target = self.parse_target_or_expr_list()?;
        self.expect(&Token::KwIn, "in 'for' statement")?;
        let iter = self.parse_expr_list()?;
        self.expect(&Token::Colon, "after 'for' iterable")?;
        let body = self.parse_block()?;
        Ok(Stmt::For {
            target,
            iter,
            body,
            is_async,
        })
    }

    fn parse_function_def(&mut self, is_async: bool) -> Result<Stmt> {
        self.expect(&Token::KwDef, "")?;
        let name = self.expect_ident("function name")?;
        self.expect(&Token::LParen, "after function name")?;
        let params = self.parse_params()?;
        self.expect(&Token::RParen, "to close parameter list")?;
        if self.eat(&Token::Arrow) {
            // Return annotation, parsed and discarded.
            self.parse_expr()?;
        }
        self.expect(&Token::Colon, "after function signature")?;
        let body = self.parse_block()?;
        let is_generator = block_contains_yield(&body);
        Ok(Stmt::FunctionDef(Arc::new(FunctionDef {
            name,
            params,
            body,
            is_async,
            is_generator,
        })))
    }

    fn parse_params(&mut self) -> Result<Params> {
        let mut params = Params::default();
        loop {
            match self.peek().clone() {
                Token::RParen => break,
                Token::DoubleStar => {
                    self.advance();
                    params.kwarg = Some(self.expect_ident("after '**'")?);
                }
                Token::Star => {
                    self.advance();
                    // Bare `*` is a keyword-only marker; `*name` collects.
                    if let Token::Ident(_) = self.peek() {
                        params.vararg = Some(self.expect_ident("after '*'")?);
                    }
                }
                Token::Ident(name) => {
                    self.advance();
                    if self.eat(&Token::Colon) {
                        // Type annotation, discarded.
                        self.parse_expr()?;
                    }
                    let default = if self.eat(&Token::Assign) {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    params.positional.push(Param { name, default });
                }
                other => {
                    return Err(self.error(format!("unexpected {other:?} in parameter list")));
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_try(&mut self) -> Result<Stmt> {
        self.expect(&Token::KwTry, "")?;
        self.expect(&Token::Colon, "after 'try'")?;
        let body = self.parse_block()?;

        let mut handlers = Vec::new();
        let mut orelse = Vec::new();
        let mut finally = Vec::new();

        loop {
            self.skip_newlines_before_keyword(&[Token::KwExcept, Token::KwElse, Token::KwFinally]);
            if self.eat(&Token::KwExcept) {
                let mut kinds = Vec::new();
                let mut name = None;
                if !self.check(&Token::Colon) {
                    if self.eat(&Token::LParen) {
                        loop {
                            kinds.push(self.expect_ident("exception class")?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(&Token::RParen, "to close exception tuple")?;
                    } else {
                        kinds.push(self.expect_ident("exception class")?);
                    }
                    if self.eat(&Token::KwAs) {
                        name = Some(self.expect_ident("after 'as'")?);
                    }
                }
                self.expect(&Token::Colon, "after 'except' clause")?;
                let handler_body = self.parse_block()?;
                handlers.push(ExceptHandler {
                    kinds,
                    name,
                    body: handler_body,
                });
            } else if self.eat(&Token::KwElse) {
                self.expect(&Token::Colon, "after 'else'")?;
                orelse = self.parse_block()?;
            } else if self.eat(&Token::KwFinally) {
                self.expect(&Token::Colon, "after 'finally'")?;
                finally = self.parse_block()?;
                break;
            } else {
                break;
            }
        }

        if handlers.is_empty() && finally.is_empty() {
            return Err(self.error("'try' requires at least one 'except' or 'finally' clause"));
        }
        Ok(Stmt::Try {
            body,
            handlers,
            orelse,
            finally,
        })
    }

    fn parse_with(&mut self, is_async: bool) -> Result<Stmt> {
        self.expect(&Token::KwWith, "")?;
        let mut items = Vec::new();
        loop {
            let ctx = self.parse_expr()?;
            let alias = if self.eat(&Token::KwAs) {
                Some(self.expect_ident("after 'as'")?)
            } else {
                None
            };
            items.push((ctx, alias));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::Colon, "after 'with' items")?;
        let body = self.parse_block()?;
        Ok(Stmt::With {
            items,
            body,
            is_async,
        })
    }

    /// An indented block, or a simple statement on the same line.
    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        if self.eat(&Token::Newline) {
            self.expect(&Token::Indent, "to start an indented block")?;
            let mut body = Vec::new();
            loop {
                self.skip_newlines();
                if self.eat(&Token::Dedent) {
                    break;
                }
                if self.check(&Token::EndOfFile) {
                    break;
                }
                body.extend(self.parse_statement()?);
            }
            if body.is_empty() {
                return Err(self.error("expected an indented block"));
            }
            Ok(body)
        } else {
            // `if x: y = 1` single-line form.
            self.parse_simple_stmt_line()
        }
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr> {
        if self.check(&Token::KwLambda) {
            return self.parse_lambda();
        }
        if self.check(&Token::KwYield) {
            self.advance();
            if self.is_end_of_simple_stmt() || self.check(&Token::RParen) {
                return Ok(Expr::Yield(None));
            }
            return Ok(Expr::Yield(Some(Box::new(self.parse_expr_list()?))));
        }
        let value = self.parse_or()?;
        // `a if cond else b`. Comprehension guards never route through
        // here (the comprehension parser calls parse_or directly), so a
        // trailing `if` always means a ternary.
        if self.check(&Token::KwIf) {
            self.advance();
            let condition = self.parse_or()?;
            self.expect(&Token::KwElse, "in conditional expression")?;
            let orelse = self.parse_expr()?;
            return Ok(Expr::IfExp {
                condition: Box::new(condition),
                then: Box::new(value),
                orelse: Box::new(orelse),
            });
        }
        Ok(value)
    }

    fn parse_lambda(&mut self) -> Result<Expr> {
        self.expect(&Token::KwLambda, "")?;
        let mut params = Params::default();
        if !self.check(&Token::Colon) {
            loop {
                match self.peek().clone() {
                    Token::DoubleStar => {
                        self.advance();
                        params.kwarg = Some(self.expect_ident("after '**'")?);
                    }
                    Token::Star => {
                        self.advance();
                        params.vararg = Some(self.expect_ident("after '*'")?);
                    }
                    Token::Ident(name) => {
                        self.advance();
                        let default = if self.eat(&Token::Assign) {
                            Some(self.parse_expr()?)
                        } else {
                            None
                        };
                        params.positional.push(Param { name, default });
                    }
                    other => {
                        return Err(
                            self.error(format!("unexpected {other:?} in lambda parameters"))
                        );
                    }
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::Colon, "after lambda parameters")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let first = self.parse_and()?;
        if !self.check(&Token::KwOr) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::KwOr) {
            values.push(self.parse_and()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::Or,
            values,
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let first = self.parse_not()?;
        if !self.check(&Token::KwAnd) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.eat(&Token::KwAnd) {
            values.push(self.parse_not()?);
        }
        Ok(Expr::BoolOp {
            op: BoolOpKind::And,
            values,
        })
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Token::KwNot) {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_bit_or()?;
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Lt => CmpOp::Lt,
                Token::Gt => CmpOp::Gt,
                Token::LtE => CmpOp::LtE,
                Token::GtE => CmpOp::GtE,
                Token::EqEq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::KwIn => CmpOp::In,
                Token::KwNot if *self.peek_at(1) == Token::KwIn => CmpOp::NotIn,
                Token::KwIs => {
                    if *self.peek_at(1) == Token::KwNot {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            if op == CmpOp::NotIn {
                self.advance();
            }
            self.advance();
            ops.push(op);
            comparators.push(self.parse_bit_or()?);
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
                comparators,
            })
        }
    }

    fn parse_bit_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_bit_xor()?;
        while self.eat(&Token::Pipe) {
            let right = self.parse_bit_xor()?;
            left = binary(BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr> {
        let mut left = self.parse_bit_and()?;
        while self.eat(&Token::Caret) {
            let right = self.parse_bit_and()?;
            left = binary(BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn parse_bit_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_shift()?;
        while self.eat(&Token::Amp) {
            let right = self.parse_shift()?;
            left = binary(BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let mut left = self.parse_arith()?;
        loop {
            let op = match self.peek() {
                Token::LShift => BinOp::LShift,
                Token::RShift => BinOp::RShift,
                _ => break,
            };
            self.advance();
            let right = self.parse_arith()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_arith(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Token::Plus => Some(UnaryOp::Pos),
            Token::Minus => Some(UnaryOp::Neg),
            Token::Tilde => Some(UnaryOp::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_factor()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_await_primary()?;
        if self.eat(&Token::DoubleStar) {
            // Right-associative; rhs may start with a unary sign.
            let exponent = self.parse_factor()?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_await_primary(&mut self) -> Result<Expr> {
        if self.eat(&Token::KwAwait) {
            let operand = self.parse_await_primary()?;
            return Ok(Expr::Await(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut value = self.parse_atom()?;
        loop {
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    value = Expr::Call {
                        func: Box::new(value),
                        args,
                    };
                }
                Token::Dot => {
                    self.advance();
                    let attr = self.expect_ident("after '.'")?;
                    value = Expr::Attribute {
                        value: Box::new(value),
                        attr,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_subscript_index()?;
                    self.expect(&Token::RBracket, "to close subscript")?;
                    value = Expr::Subscript {
                        value: Box::new(value),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_subscript_index(&mut self) -> Result<Expr> {
        // Slice forms: [a:b], [:b], [a:], [::c], plus plain index and
        // tuple indices.
        let lower = if self.check(&Token::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        if !self.eat(&Token::Colon) {
            let index = *lower.ok_or_else(|| self.error("empty subscript"))?;
            // Tuple index: d[(a, b)] written d[a, b].
            if self.check(&Token::Comma) {
                let mut items = vec![index];
                while self.eat(&Token::Comma) {
                    if self.check(&Token::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                return Ok(Expr::Tuple(items));
            }
            return Ok(index);
        }
        let upper = if self.check(&Token::Colon) || self.check(&Token::RBracket) {
            None
        } else {
            Some(Box::new(self.parse_expr()?))
        };
        let step = if self.eat(&Token::Colon) {
            if self.check(&Token::RBracket) {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            match self.peek().clone() {
                Token::DoubleStar => {
                    self.advance();
                    args.push(CallArg::DoubleStar(self.parse_expr()?));
                }
                Token::Star => {
                    self.advance();
                    args.push(CallArg::Star(self.parse_expr()?));
                }
                Token::Ident(name) if *self.peek_at(1) == Token::Assign => {
                    self.advance();
                    self.advance();
                    args.push(CallArg::Keyword(name, self.parse_expr()?));
                }
                _ => {
                    let value = self.parse_expr()?;
                    // Generator expression argument: sum(x for x in xs).
                    if self.check(&Token::KwFor) {
                        let generators = self.parse_comprehension_clauses()?;
                        args.push(CallArg::Positional(Expr::ListComp {
                            element: Box::new(value),
                            generators,
                        }));
                    } else {
                        args.push(CallArg::Positional(value));
                    }
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
            if self.check(&Token::RParen) {
                break;
            }
        }
        self.expect(&Token::RParen, "to close call arguments")?;
        Ok(args)
    }

    fn parse_comprehension_clauses(&mut self) -> Result<Vec<Comprehension>> {
        let mut generators = Vec::new();
        loop {
            // `async for` inside a comprehension behaves like `for` here.
            if self.check(&Token::KwAsync) && *self.peek_at(1) == Token::KwFor {
                self.advance();
            }
            if !self.eat(&Token::KwFor) {
                break;
            }
            let target = self.parse_comp_target()?;
            self.expect(&Token::KwIn, "in comprehension")?;
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.check(&Token::KwIf) {
                self.advance();
                conditions.push(self.parse_or()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
            if !self.check(&Token::KwFor)
                && !(self.check(&Token::KwAsync) && *self.peek_at(1) == Token::KwFor)
            {
                break;
            }
        }
        if generators.is_empty() {
            return Err(self.error("expected 'for' in comprehension"));
        }
        Ok(generators)
    }

    fn parse_comp_target(&mut self) -> Result<Expr> {
        let first = self.parse_postfix()?;
        if !self.check(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.check(&Token::KwIn) {
                break;
            }
            items.push(self.parse_postfix()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::KwNone => {
                self.advance();
                Ok(Expr::Literal(Literal::None))
            }
            Token::KwTrue => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            Token::KwFalse => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            Token::Int(value) => {
                self.advance();
                Ok(Expr::Literal(Literal::Int(value)))
            }
            Token::Float(value) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(value)))
            }
            Token::Str {
                value,
                fstring,
                bytes,
            } => {
                self.advance();
                if fstring {
                    return parse_fstring(&value).map_err(|e| {
                        Error::parse(format!("line {}: in f-string: {}", self.line(), e))
                    });
                }
                // Implicit adjacent-string concatenation: "a" "b".
                let mut combined = value;
                let mut is_bytes = bytes;
                while let Token::Str {
                    value: next,
                    fstring: false,
                    bytes: next_bytes,
                } = self.peek().clone()
                {
                    self.advance();
                    combined.push_str(&next);
                    is_bytes = is_bytes || next_bytes;
                }
                if is_bytes {
                    Ok(Expr::Literal(Literal::Bytes(combined.into_bytes())))
                } else {
                    Ok(Expr::Literal(Literal::Str(combined)))
                }
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            Token::KwLambda => self.parse_lambda(),
            Token::KwAwait => self.parse_await_primary(),
            Token::LParen => {
                self.advance();
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_expr_or_starred()?;
                if self.check(&Token::KwFor)
                    || (self.check(&Token::KwAsync) && *self.peek_at(1) == Token::KwFor)
                {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Token::RParen, "to close generator expression")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        generators,
                    });
                }
                if self.check(&Token::Comma) {
                    let mut items = vec![first];
                    while self.eat(&Token::Comma) {
                        if self.check(&Token::RParen) {
                            break;
                        }
                        items.push(self.parse_expr_or_starred()?);
                    }
                    self.expect(&Token::RParen, "to close tuple")?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(&Token::RParen, "to close parenthesized expression")?;
                Ok(first)
            }
            Token::LBracket => {
                self.advance();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expr_or_starred()?;
                if self.check(&Token::KwFor)
                    || (self.check(&Token::KwAsync) && *self.peek_at(1) == Token::KwFor)
                {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Token::RBracket, "to close list comprehension")?;
                    return Ok(Expr::ListComp {
                        element: Box::new(first),
                        generators,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Token::Comma) {
                    if self.check(&Token::RBracket) {
                        break;
                    }
                    items.push(self.parse_expr_or_starred()?);
                }
                self.expect(&Token::RBracket, "to close list")?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                self.advance();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.eat(&Token::Colon) {
                    // Dict display or dict comprehension.
                    let first_value = self.parse_expr()?;
                    if self.check(&Token::KwFor) {
                        let generators = self.parse_comprehension_clauses()?;
                        self.expect(&Token::RBrace, "to close dict comprehension")?;
                        return Ok(Expr::DictComp {
                            key: Box::new(first),
                            value: Box::new(first_value),
                            generators,
                        });
                    }
                    let mut entries = vec![(first, first_value)];
                    while self.eat(&Token::Comma) {
                        if self.check(&Token::RBrace) {
                            break;
                        }
                        let key = self.parse_expr()?;
                        self.expect(&Token::Colon, "in dict entry")?;
                        let value = self.parse_expr()?;
                        entries.push((key, value));
                    }
                    self.expect(&Token::RBrace, "to close dict")?;
                    return Ok(Expr::Dict(entries));
                }
                // Set display or set comprehension.
                if self.check(&Token::KwFor) {
                    let generators = self.parse_comprehension_clauses()?;
                    self.expect(&Token::RBrace, "to close set comprehension")?;
                    return Ok(Expr::SetComp {
                        element: Box::new(first),
                        generators,
                    });
                }
                let mut items = vec![first];
                while self.eat(&Token::Comma) {
                    if self.check(&Token::RBrace) {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect(&Token::RBrace, "to close set")?;
                Ok(Expr::Set(items))
            }
            other => Err(self.error(format!("unexpected {other:?} in expression"))),
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Detect `yield` at function depth (not inside nested defs/lambdas).
fn block_contains_yield(body: &[Stmt]) -> bool {
    body.iter().any(stmt_contains_yield)
}

fn stmt_contains_yield(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Expr(e) | Stmt::Raise(Some(e)) => expr_contains_yield(e),
        Stmt::Assign { targets, value } => {
            targets.iter().any(expr_contains_yield) || expr_contains_yield(value)
        }
        Stmt::AugAssign { target, value, .. } => {
            expr_contains_yield(target) || expr_contains_yield(value)
        }
        Stmt::AnnAssign { value, .. } => value.as_ref().is_some_and(expr_contains_yield),
        Stmt::Return(Some(e)) => expr_contains_yield(e),
        Stmt::If { branches, orelse } => {
            branches
                .iter()
                .any(|(c, b)| expr_contains_yield(c) || block_contains_yield(b))
                || block_contains_yield(orelse)
        }
        Stmt::While { condition, body } => {
            expr_contains_yield(condition) || block_contains_yield(body)
        }
        Stmt::For { iter, body, .. } => expr_contains_yield(iter) || block_contains_yield(body),
        Stmt::Try {
            body,
            handlers,
            orelse,
            finally,
        } => {
            block_contains_yield(body)
                || handlers.iter().any(|h| block_contains_yield(&h.body))
                || block_contains_yield(orelse)
                || block_contains_yield(finally)
        }
        Stmt::With { items, body, .. } => {
            items.iter().any(|(e, _)| expr_contains_yield(e)) || block_contains_yield(body)
        }
        Stmt::Assert { condition, message } => {
            expr_contains_yield(condition) || message.as_ref().is_some_and(expr_contains_yield)
        }
        _ => false,
    }
}

fn expr_contains_yield(expr: &Expr) -> bool {
    match expr {
        Expr::Yield(_) => true,
        Expr::Await(e) | Expr::Starred(e) | Expr::Unary { operand: e, .. } => {
            expr_contains_yield(e)
        }
        Expr::Binary { left, right, .. } => expr_contains_yield(left) || expr_contains_yield(right),
        Expr::BoolOp { values, .. } | Expr::Tuple(values) | Expr::List(values)
        | Expr::Set(values) => values.iter().any(expr_contains_yield),
        Expr::Dict(entries) => entries
            .iter()
            .any(|(k, v)| expr_contains_yield(k) || expr_contains_yield(v)),
        Expr::Compare {
            left, comparators, ..
        } => expr_contains_yield(left) || comparators.iter().any(expr_contains_yield),
        Expr::Call { func, args } => {
            expr_contains_yield(func)
                || args.iter().any(|a| match a {
                    CallArg::Positional(e)
                    | CallArg::Keyword(_, e)
                    | CallArg::Star(e)
                    | CallArg::DoubleStar(e) => expr_contains_yield(e),
                })
        }
        Expr::Attribute { value, .. } | Expr::Subscript { value, .. } => expr_contains_yield(value),
        Expr::IfExp {
            condition,
            then,
            orelse,
        } => {
            expr_contains_yield(condition)
                || expr_contains_yield(then)
                || expr_contains_yield(orelse)
        }
        _ => false,
    }
}

/// Split a cooked f-string body into literal runs and `{...}` expressions.
/// `{{` and `}}` are brace escapes; `!r` requests repr; `:spec` carries a
/// plain-text format spec.
fn parse_fstring(body: &str) -> std::result::Result<Expr, String> {
    let mut parts: Vec<FStringPart> = Vec::new();
    let mut literal = String::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err("single '}' is not allowed".to_string()),
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let mut inner = String::new();
                let mut depth = 1;
                for c in chars.by_ref() {
                    match c {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                    inner.push(c);
                }
                if depth != 0 {
                    return Err("unterminated '{' in f-string".to_string());
                }

                // Peel a trailing :spec (outside brackets) and a !r flag.
                let (expr_text, spec) = split_format_spec(&inner);
                let (expr_text, repr) = match expr_text.strip_suffix("!r") {
                    Some(stripped) => (stripped.to_string(), true),
                    None => (expr_text, false),
                };

                let tokens = Lexer::new(&expr_text)
                    .tokenize()
                    .map_err(|e| e.to_string())?;
                let mut parser = Parser { tokens, pos: 0 };
                let expr = parser.parse_expr().map_err(|e| e.to_string())?;
                parts.push(FStringPart::Expr { expr, spec, repr });
            }
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(Expr::FString(parts))
}

/// Split `expr:spec` at the first top-level colon. Colons inside brackets
/// (slices, dict literals, lambdas are excluded by depth tracking) stay
/// with the expression.
fn split_format_spec(inner: &str) -> (String, Option<String>) {
    let mut depth = 0usize;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => {
                return (
                    inner[..i].to_string(),
                    Some(inner[i + 1..].to_string()),
                );
            }
            _ => {}
        }
    }
    (inner.to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Program {
        parse(source).unwrap()
    }

    #[test]
    fn test_assignment_forms() {
        let program = parse_ok("x = 1\na, b = 1, 2\n[p, *rest] = items\nx += 2\nn: int = 3\n");
        assert_eq!(program.body.len(), 5);
        assert!(matches!(program.body[0], Stmt::Assign { .. }));
        assert!(matches!(program.body[3], Stmt::AugAssign { .. }));
        assert!(matches!(program.body[4], Stmt::AnnAssign { .. }));
    }

    #[test]
    fn test_function_def_with_defaults_and_varargs() {
        let program = parse_ok("def f(a, b=2, *args, **kwargs):\n    return a + b\n");
        match &program.body[0] {
            Stmt::FunctionDef(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params.positional.len(), 2);
                assert_eq!(def.params.vararg.as_deref(), Some("args"));
                assert_eq!(def.params.kwarg.as_deref(), Some("kwargs"));
                assert!(!def.is_generator);
            }
            other => panic!("expected function def, got {other:?}"),
        }
    }

    #[test]
    fn test_generator_detection() {
        let program = parse_ok("def gen(n):\n    for i in range(n):\n        yield i\n");
        match &program.body[0] {
            Stmt::FunctionDef(def) => assert!(def.is_generator),
            other => panic!("expected function def, got {other:?}"),
        }
    }

    #[test]
    fn test_ternary_orientation() {
        let program = parse_ok("x = 1 if cond else 2\n");
        match &program.body[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::IfExp {
                    condition, then, ..
                } => {
                    assert!(matches!(condition.as_ref(), Expr::Name(n) if n == "cond"));
                    assert!(matches!(
                        then.as_ref(),
                        Expr::Literal(Literal::Int(1))
                    ));
                }
                other => panic!("expected ternary, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_comprehensions() {
        parse_ok("xs = [x * 2 for x in items if x > 0]\n");
        parse_ok("pairs = {k: v for k, v in entries}\n");
        parse_ok("uniq = {x for x in items}\n");
        parse_ok("total = sum(x for x in items)\n");
    }

    #[test]
    fn test_try_except_finally() {
        let program = parse_ok(
            "try:\n    risky()\nexcept (ValueError, KeyError) as e:\n    handle(e)\nfinally:\n    cleanup()\n",
        );
        match &program.body[0] {
            Stmt::Try {
                handlers, finally, ..
            } => {
                assert_eq!(handlers[0].kinds, vec!["ValueError", "KeyError"]);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(finally.len(), 1);
            }
            other => panic!("expected try, got {other:?}"),
        }
    }

    #[test]
    fn test_await_and_async_def() {
        let program = parse_ok("async def go():\n    r = await fetch(url=u)\n    return r\n");
        match &program.body[0] {
            Stmt::FunctionDef(def) => assert!(def.is_async),
            other => panic!("expected async def, got {other:?}"),
        }
        parse_ok("result = await tool(x=1)\n");
    }

    #[test]
    fn test_fstring_parsing() {
        let program = parse_ok("s = f'value={x + 1:>8} and {y!r}'\n");
        match &program.body[0] {
            Stmt::Assign { value, .. } => match value {
                Expr::FString(parts) => {
                    assert!(matches!(&parts[0], FStringPart::Literal(l) if l == "value="));
                    assert!(
                        matches!(&parts[1], FStringPart::Expr { spec: Some(s), .. } if s == ">8")
                    );
                    assert!(matches!(&parts[3], FStringPart::Expr { repr: true, .. }));
                }
                other => panic!("expected f-string, got {other:?}"),
            },
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_slices() {
        parse_ok("a = xs[1:3]\nb = xs[:2]\nc = xs[::2]\nd = xs[-1]\n");
    }

    #[test]
    fn test_unsupported_constructs_rejected() {
        assert!(parse("class Foo:\n    pass\n").is_err());
        assert!(parse("from os import *\n").is_err());
        assert!(parse("@decorator\ndef f():\n    pass\n").is_err());
    }

    #[test]
    fn test_with_statement() {
        let program = parse_ok("with open_session(url=u) as s:\n    s\n");
        match &program.body[0] {
            Stmt::With { items, .. } => {
                assert_eq!(items[0].1.as_deref(), Some("s"));
            }
            other => panic!("expected with, got {other:?}"),
        }
    }

    #[test]
    fn test_chained_comparison() {
        let program = parse_ok("ok = 0 <= x < 10\n");
        match &program.body[0] {
            Stmt::Assign { value, .. } => {
                assert!(matches!(value, Expr::Compare { ops, .. } if ops.len() == 2));
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_import_forms() {
        let program = parse_ok("import math\nfrom json import dumps as d, loads\n");
        assert!(matches!(&program.body[0], Stmt::Import(m) if m[0].0 == "math"));
        match &program.body[1] {
            Stmt::ImportFrom { module, names } => {
                assert_eq!(module, "json");
                assert_eq!(names[0], ("dumps".to_string(), Some("d".to_string())));
            }
            other => panic!("expected from-import, got {other:?}"),
        }
    }
}
