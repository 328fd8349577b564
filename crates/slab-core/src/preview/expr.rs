//! Arithmetic for preview entries.
//!
//! Grammar (no other tokens are accepted):
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := '-' unary | atom
//! atom  := integer | "mid" | "end"
//! ```

/// Values bound to the symbolic tokens for one dimension.
#[derive(Debug, Clone, Copy)]
pub struct Symbols {
    pub mid: i64,
    pub end: i64,
}

impl Symbols {
    /// Symbols for a dimension of the given extent.
    pub fn for_extent(extent: usize) -> Self {
        let extent = extent as i64;
        Self {
            mid: (extent / 2 - 1).max(0),
            end: extent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Mid,
    End,
    Plus,
    Minus,
    Star,
    Slash,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let value = digits
                    .parse::<i64>()
                    .map_err(|e| format!("bad integer '{}': {}", digits, e))?;
                tokens.push(Token::Int(value));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "mid" => tokens.push(Token::Mid),
                    "end" => tokens.push(Token::End),
                    _ => return Err(format!("unknown token '{}'", word)),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    symbols: Symbols,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<i64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value = value.checked_add(self.term()?).ok_or("overflow")?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value = value.checked_sub(self.term()?).ok_or("overflow")?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<i64, String> {
        let mut value = self.unary()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value = value.checked_mul(self.unary()?).ok_or("overflow")?;
                }
                Token::Slash => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0 {
                        return Err("division by zero".to_string());
                    }
                    value = value.div_euclid(rhs);
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<i64, String> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<i64, String> {
        match self.next() {
            Some(Token::Int(v)) => Ok(v),
            Some(Token::Mid) => Ok(self.symbols.mid),
            Some(Token::End) => Ok(self.symbols.end),
            Some(other) => Err(format!("expected a value, found {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Evaluate one preview component.
pub fn evaluate(src: &str, symbols: Symbols) -> Result<i64, String> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        symbols,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        return Err(format!("trailing input in '{}'", src));
    }
    Ok(value)
}
