//! Parser for the surface syntax.
//!
//! ```text
//! exp        ::= ('\' | 'λ') rest_of_lambda | atomic_exp atomic_exp*
//! rest_of_lam::= ident* '.' exp
//! atomic_exp ::= ident | '(' exp ')'
//! ident      ::= [A-Za-z_]+
//! ```
//!
//! Whitespace is space, tab, and newline; comments are `/- … -/`. Names are
//! resolved during parsing, so the AST carries de Bruijn indices and unbound
//! variables are rejected here with a byte offset.

use std::fmt;

/// A parse error, reported at the byte offset where it was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset into the source text.
    pub offset: usize,
    /// Error message.
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "parse error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Result of a parser operation.
pub type ParseResult<T> = Result<T, ParseError>;

/// A surface term with variables resolved to de Bruijn indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ast {
    /// A variable; 0 names the innermost enclosing binder.
    Var(u32),
    Lam(Box<Ast>),
    App(Box<Ast>, Box<Ast>),
}

/// Parse a closed term.
pub fn parse(text: &str) -> ParseResult<Ast> {
    let mut p = Parser {
        text: text.as_bytes(),
        pos: 0,
    };
    p.skip_whitespace()?;
    let mut scope = Vec::new();
    let exp = p.parse_exp(&mut scope)?;
    if p.pos != p.text.len() {
        return p.error("expected end of input");
    }
    log::debug!("parsed {} bytes of source", text.len());
    Ok(exp)
}

struct Parser<'a> {
    text: &'a [u8],
    pos: usize,
}

// "λ" in UTF-8.
const LAMBDA: &[u8] = "\u{3bb}".as_bytes();

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

impl<'a> Parser<'a> {
    fn error<T>(&self, message: &str) -> ParseResult<T> {
        self.error_at(self.pos, message)
    }

    fn error_at<T>(&self, offset: usize, message: &str) -> ParseResult<T> {
        Err(ParseError {
            offset,
            message: message.to_string(),
        })
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) -> ParseResult<()> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\n') => self.pos += 1,
                Some(b'/') if self.text.get(self.pos + 1) == Some(&b'-') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.text.len() {
                            return self.error_at(start, "unterminated comment");
                        }
                        if self.text[self.pos] == b'-' && self.text[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Parse `[A-Za-z_]+` and the whitespace after it.
    fn parse_ident(&mut self) -> ParseResult<&'a str> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return self.error("expected variable");
        }
        let name = std::str::from_utf8(&self.text[start..self.pos]).unwrap();
        self.skip_whitespace()?;
        Ok(name)
    }

    fn parse_var(&mut self, scope: &[&'a str]) -> ParseResult<Ast> {
        let start = self.pos;
        let name = self.parse_ident()?;
        for (idx, bound) in scope.iter().rev().enumerate() {
            if *bound == name {
                return Ok(Ast::Var(idx as u32));
            }
        }
        self.error_at(start, "variable not in scope")
    }

    // atomic_exp ::= ident | '(' exp ')'
    fn parse_atomic_exp(&mut self, scope: &mut Vec<&'a str>) -> ParseResult<Ast> {
        if self.peek() == Some(b'(') {
            self.pos += 1;
            self.skip_whitespace()?;
            let exp = self.parse_exp(scope)?;
            if self.peek() == Some(b')') {
                self.pos += 1;
                self.skip_whitespace()?;
                Ok(exp)
            } else {
                self.error("expected ')'")
            }
        } else {
            self.parse_var(scope)
        }
    }

    // rest_of_lambda ::= ident* '.' exp
    fn parse_rest_of_lambda(&mut self, scope: &mut Vec<&'a str>) -> ParseResult<Ast> {
        match self.peek() {
            None => self.error("expected '.', got end of input"),
            Some(b'.') => {
                self.pos += 1;
                self.skip_whitespace()?;
                self.parse_exp(scope)
            }
            _ => {
                let name = self.parse_ident()?;
                scope.push(name);
                let body = self.parse_rest_of_lambda(scope);
                scope.pop();
                Ok(Ast::Lam(Box::new(body?)))
            }
        }
    }

    // exp ::= '\' rest_of_lambda | 'λ' rest_of_lambda | atomic_exp atomic_exp*
    fn parse_exp(&mut self, scope: &mut Vec<&'a str>) -> ParseResult<Ast> {
        if self.peek() == Some(b'\\') {
            self.pos += 1;
            self.skip_whitespace()?;
            return self.parse_rest_of_lambda(scope);
        }
        if self.text[self.pos..].starts_with(LAMBDA) {
            self.pos += LAMBDA.len();
            self.skip_whitespace()?;
            return self.parse_rest_of_lambda(scope);
        }
        let mut func = self.parse_atomic_exp(scope)?;
        while !matches!(self.peek(), None | Some(b')')) {
            let arg = self.parse_atomic_exp(scope)?;
            func = Ast::App(Box::new(func), Box::new(arg));
        }
        Ok(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(i: u32) -> Ast {
        Ast::Var(i)
    }
    fn lam(b: Ast) -> Ast {
        Ast::Lam(Box::new(b))
    }
    fn app(f: Ast, a: Ast) -> Ast {
        Ast::App(Box::new(f), Box::new(a))
    }

    #[test]
    fn identity() {
        assert_eq!(parse("λ x. x").unwrap(), lam(var(0)));
        assert_eq!(parse("\\x. x").unwrap(), lam(var(0)));
    }

    #[test]
    fn multi_binder_lambda() {
        // λ f x. f x ≡ λ f. λ x. f x
        assert_eq!(
            parse("λ f x. f x").unwrap(),
            lam(lam(app(var(1), var(0))))
        );
    }

    #[test]
    fn application_is_left_associative() {
        assert_eq!(
            parse("λ a b c. a b c").unwrap(),
            lam(lam(lam(app(app(var(2), var(1)), var(0)))))
        );
    }

    #[test]
    fn parens_group() {
        assert_eq!(
            parse("λ a b c. a (b c)").unwrap(),
            lam(lam(lam(app(var(2), app(var(1), var(0))))))
        );
    }

    #[test]
    fn shadowing_resolves_to_innermost() {
        assert_eq!(parse("λ x. λ x. x").unwrap(), lam(lam(var(0))));
    }

    #[test]
    fn comments_and_whitespace() {
        assert_eq!(
            parse("λ x. /- the identity -/ x\n").unwrap(),
            lam(var(0))
        );
    }

    #[test]
    fn unbound_variable() {
        // "λ" is two bytes, so `y` sits at byte offset 6.
        let err = parse("λ x. y").unwrap_err();
        assert_eq!(err.offset, 6);
        assert!(err.message.contains("not in scope"));
    }

    #[test]
    fn unterminated_comment() {
        let err = parse("λ x. x /- oops").unwrap_err();
        assert!(err.message.contains("unterminated comment"));
        assert_eq!(err.offset, 8);
    }

    #[test]
    fn trailing_junk() {
        let err = parse("(λ x. x))").unwrap_err();
        assert!(err.message.contains("end of input"));
    }

    #[test]
    fn missing_dot() {
        assert!(parse("λ x").is_err());
        assert!(parse("λ x y").is_err());
    }

    #[test]
    fn missing_close_paren() {
        let err = parse("(λ x. x").unwrap_err();
        assert!(err.message.contains("')'"));
    }
}
