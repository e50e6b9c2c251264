use serde_json::{Number, Value};

use super::helpers::Helper;
use super::{Arg, CompileError, Expr, Node, Path};

/// Characters Handlebars does not allow in an identifier segment.
const RESERVED_PATH_CHARS: &str = "!\"#%&'()*+,./;<=>@[\\]^`{|}~";

struct OpenBlock {
    name: &'static str,
    negate: bool,
    condition: Path,
    then: Vec<Node>,
    otherwise: Option<Vec<Node>>,
    offset: usize,
}

enum RawTag<'a> {
    Comment,
    Mustache(&'a str),
}

enum Token {
    Word(String),
    Str(String),
}

pub(super) fn parse(source: &str) -> Result<Vec<Node>, CompileError> {
    let mut root = Vec::new();
    let mut stack: Vec<OpenBlock> = Vec::new();
    let mut pos = 0;

    while let Some(rel) = source[pos..].find("{{") {
        let start = pos + rel;
        push_text(current(&mut root, &mut stack), &source[pos..start]);

        let (tag, end) = read_tag(source, start)?;
        pos = end;

        let inner = match tag {
            RawTag::Comment => continue,
            RawTag::Mustache(inner) => inner.trim(),
        };

        if inner.is_empty() {
            return Err(CompileError::new("empty tag", start));
        }

        if let Some(open) = inner.strip_prefix('#') {
            stack.push(open_block(open, start)?);
        } else if let Some(close) = inner.strip_prefix('/') {
            let block = close_block(&mut stack, close.trim(), start)?;
            current(&mut root, &mut stack).push(block);
        } else if inner == "else" {
            match stack.last_mut() {
                Some(block) if block.otherwise.is_none() => block.otherwise = Some(Vec::new()),
                Some(block) => {
                    return Err(CompileError::new(
                        format!("duplicate {{{{else}}}} in {{{{#{}}}}} block", block.name),
                        start,
                    ))
                }
                None => {
                    return Err(CompileError::new(
                        "{{else}} outside of a block",
                        start,
                    ))
                }
            }
        } else {
            let expr = parse_expression(inner, start)?;
            current(&mut root, &mut stack).push(Node::Expr(expr));
        }
    }
    push_text(current(&mut root, &mut stack), &source[pos..]);

    if let Some(open) = stack.pop() {
        return Err(CompileError::new(
            format!("unclosed {{{{#{}}}}} block", open.name),
            open.offset,
        ));
    }
    Ok(root)
}

fn current<'a>(root: &'a mut Vec<Node>, stack: &'a mut [OpenBlock]) -> &'a mut Vec<Node> {
    match stack.last_mut() {
        Some(block) => match &mut block.otherwise {
            Some(otherwise) => otherwise,
            None => &mut block.then,
        },
        None => root,
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

/// Read one `{{...}}` tag starting at `start`. Returns the tag and the byte
/// offset just past its closing braces.
fn read_tag(source: &str, start: usize) -> Result<(RawTag<'_>, usize), CompileError> {
    let rest = &source[start..];
    let (open, close) = if rest.starts_with("{{!--") {
        ("{{!--", "--}}")
    } else if rest.starts_with("{{!") {
        ("{{!", "}}")
    } else if rest.starts_with("{{{") {
        ("{{{", "}}}")
    } else {
        ("{{", "}}")
    };

    let body_start = start + open.len();
    let body_len = source[body_start..]
        .find(close)
        .ok_or_else(|| CompileError::new(format!("unclosed tag, expected '{}'", close), start))?;
    let body = &source[body_start..body_start + body_len];
    let end = body_start + body_len + close.len();

    let tag = if open.starts_with("{{!") {
        RawTag::Comment
    } else {
        RawTag::Mustache(body)
    };
    Ok((tag, end))
}

fn open_block(body: &str, offset: usize) -> Result<OpenBlock, CompileError> {
    let tokens = tokenize(body, offset)?;
    let (name, negate) = match tokens.first() {
        Some(Token::Word(w)) if w == "if" => ("if", false),
        Some(Token::Word(w)) if w == "unless" => ("unless", true),
        Some(Token::Word(w)) => {
            return Err(CompileError::new(
                format!("unknown block helper '{}'", w),
                offset,
            ))
        }
        _ => return Err(CompileError::new("block tag without a name", offset)),
    };

    let condition = match &tokens[1..] {
        [Token::Word(word)] => parse_path(word, offset)?,
        _ => {
            return Err(CompileError::new(
                format!("{{{{#{}}}}} takes exactly one path", name),
                offset,
            ))
        }
    };

    Ok(OpenBlock {
        name,
        negate,
        condition,
        then: Vec::new(),
        otherwise: None,
        offset,
    })
}

fn close_block(stack: &mut Vec<OpenBlock>, name: &str, offset: usize) -> Result<Node, CompileError> {
    let block = stack.pop().ok_or_else(|| {
        CompileError::new(format!("{{{{/{}}}}} without a matching open block", name), offset)
    })?;
    if block.name != name {
        return Err(CompileError::new(
            format!(
                "{{{{/{}}}}} does not match open {{{{#{}}}}}",
                name, block.name
            ),
            offset,
        ));
    }
    Ok(Node::Conditional {
        condition: block.condition,
        negate: block.negate,
        then: block.then,
        otherwise: block.otherwise.unwrap_or_default(),
    })
}

fn parse_expression(body: &str, offset: usize) -> Result<Expr, CompileError> {
    let tokens = tokenize(body, offset)?;
    let (head, rest) = tokens
        .split_first()
        .ok_or_else(|| CompileError::new("empty tag", offset))?;

    let head = match head {
        Token::Word(word) => word,
        Token::Str(_) => {
            return Err(CompileError::new(
                "expected a path or helper name, found a string literal",
                offset,
            ))
        }
    };

    if let Some(helper) = Helper::from_name(head) {
        let args = rest
            .iter()
            .map(|token| parse_arg(token, offset))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Expr::Helper { helper, args });
    }

    if !rest.is_empty() {
        return Err(CompileError::new(format!("unknown helper '{}'", head), offset));
    }
    Ok(Expr::Path(parse_path(head, offset)?))
}

fn parse_arg(token: &Token, offset: usize) -> Result<Arg, CompileError> {
    let word = match token {
        Token::Str(s) => return Ok(Arg::Literal(Value::String(s.clone()))),
        Token::Word(word) => word.as_str(),
    };
    match word {
        "true" => return Ok(Arg::Literal(Value::Bool(true))),
        "false" => return Ok(Arg::Literal(Value::Bool(false))),
        "null" => return Ok(Arg::Literal(Value::Null)),
        "undefined" => return Ok(Arg::Undefined),
        _ => {}
    }
    if let Ok(n) = word.parse::<i64>() {
        return Ok(Arg::Literal(Value::Number(n.into())));
    }
    if let Some(n) = word.parse::<f64>().ok().and_then(Number::from_f64) {
        return Ok(Arg::Literal(Value::Number(n)));
    }
    Ok(Arg::Path(parse_path(word, offset)?))
}

fn parse_path(word: &str, offset: usize) -> Result<Path, CompileError> {
    if word == "this" || word == "." {
        return Ok(Path(Vec::new()));
    }
    if word.starts_with("..") || word.contains("../") {
        return Err(CompileError::new(
            format!("parent paths are not supported: '{}'", word),
            offset,
        ));
    }
    let malformed = || CompileError::new(format!("malformed path '{}'", word), offset);

    let mut rest = word
        .strip_prefix("this.")
        .or_else(|| word.strip_prefix("./"))
        .unwrap_or(word);
    let mut segments = Vec::new();
    loop {
        let (segment, tail) = if let Some(bracketed) = rest.strip_prefix('[') {
            let close = bracketed.find(']').ok_or_else(malformed)?;
            (&bracketed[..close], &bracketed[close + 1..])
        } else {
            let end = rest.find('.').unwrap_or(rest.len());
            let segment = &rest[..end];
            if segment.chars().any(|c| c.is_whitespace() || RESERVED_PATH_CHARS.contains(c)) {
                return Err(malformed());
            }
            (segment, &rest[end..])
        };
        if segment.is_empty() {
            return Err(malformed());
        }
        segments.push(segment.to_string());

        if tail.is_empty() {
            break;
        }
        rest = tail.strip_prefix('.').ok_or_else(malformed)?;
    }
    Ok(Path(segments))
}

fn tokenize(body: &str, offset: usize) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' || c == '\'' {
            chars.next();
            let mut literal = String::new();
            let mut closed = false;
            while let Some(ch) = chars.next() {
                match ch {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            literal.push(escaped);
                        }
                    }
                    ch if ch == c => {
                        closed = true;
                        break;
                    }
                    ch => literal.push(ch),
                }
            }
            if !closed {
                return Err(CompileError::new("unterminated string literal", offset));
            }
            tokens.push(Token::Str(literal));
            continue;
        }

        let mut word = String::new();
        let mut in_brackets = false;
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() && !in_brackets {
                break;
            }
            match ch {
                '[' => in_brackets = true,
                ']' => in_brackets = false,
                _ => {}
            }
            word.push(ch);
            chars.next();
        }
        tokens.push(Token::Word(word));
    }
    Ok(tokens)
}
