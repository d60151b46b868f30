//! Tokenizer for the expression language.

use super::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Question,
    Colon,
    Bang,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let (tok, next) = number(&chars, i)?;
            tokens.push(tok);
            i = next;
            continue;
        }
        if c == '_' || c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i] == '_' || chars[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "in" => Token::In,
                _ => Token::Ident(word),
            });
            continue;
        }
        if c == '"' || c == '\'' {
            let (s, next) = string(&chars, i)?;
            tokens.push(Token::Str(s));
            i = next;
            continue;
        }

        let two = chars.get(i + 1).copied();
        let (tok, width) = match (c, two) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('!', _) => (Token::Bang, 1),
            ('-', _) => (Token::Minus, 1),
            ('+', _) => (Token::Plus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            _ => {
                return Err(CompileError::new(format!(
                    "unexpected character '{c}' at offset {i}"
                )));
            }
        };
        tokens.push(tok);
        i += width;
    }
    Ok(tokens)
}

fn number(chars: &[char], start: usize) -> Result<(Token, usize), CompileError> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    // Unsigned suffix is accepted and ignored.
    if i < chars.len() && (chars[i] == 'u' || chars[i] == 'U') {
        i += 1;
    }
    let tok = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| CompileError::new(format!("invalid number '{text}'")))?,
        )
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| CompileError::new(format!("integer out of range '{text}'")))?,
        )
    };
    Ok((tok, i))
}

fn string(chars: &[char], start: usize) -> Result<(String, usize), CompileError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let esc = chars
                .get(i + 1)
                .ok_or_else(|| CompileError::new("unterminated escape"))?;
            out.push(match esc {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                other => {
                    return Err(CompileError::new(format!("unknown escape '\\{other}'")));
                }
            });
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }
    Err(CompileError::new("unterminated string literal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison() {
        let toks = tokenize("metadata.team == 'platform'").unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Ident("metadata".into()),
                Token::Dot,
                Token::Ident("team".into()),
                Token::EqEq,
                Token::Str("platform".into()),
            ]
        );
    }

    #[test]
    fn numbers_and_escapes() {
        let toks = tokenize(r#"1 2.5 3e2 "a\"b""#).unwrap();
        assert_eq!(
            toks,
            vec![
                Token::Int(1),
                Token::Float(2.5),
                Token::Float(300.0),
                Token::Str("a\"b".into())
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("'abc").is_err());
        assert!(tokenize("a # b").is_err());
    }
}
