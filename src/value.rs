//! Default-value literals and their decoding into channel bytes.
//!
//! Scalars are plain tokens (`1`, `-2.5`, `true`). Arrays and structures use
//! braces, with commas or whitespace between elements: `{1, 2}`, `{{1 2} {3 4}}`.
//! Structures list their members in introspection order.

use crate::error::{Error, Result};
use crate::memory::Scalar;
use crate::types::{BasicType, TypeDescriptor, TypeKind, TypeRegistry};

/// Parsed literal tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A single token.
    Scalar(String),
    /// A brace-delimited list.
    List(Vec<Literal>),
}

impl Literal {
    /// Parse a literal.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text);
        let mut pos = 0;
        let literal = parse_tokens(&tokens, &mut pos, text)?;
        if pos != tokens.len() {
            return Err(Error::parameters(format!("trailing input in literal '{text}'")));
        }
        Ok(literal)
    }

    fn flatten<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Literal::Scalar(s) => out.push(s),
            Literal::List(items) => items.iter().for_each(|i| i.flatten(out)),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => quoted = !quoted,
            '{' | '}' if !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_string());
            }
            ',' if !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_tokens(tokens: &[String], pos: &mut usize, text: &str) -> Result<Literal> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| Error::parameters(format!("unexpected end of literal '{text}'")))?;
    *pos += 1;
    match token.as_str() {
        "{" => {
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos).map(String::as_str) {
                    Some("}") => {
                        *pos += 1;
                        return Ok(Literal::List(items));
                    }
                    Some(_) => items.push(parse_tokens(tokens, pos, text)?),
                    None => {
                        return Err(Error::parameters(format!("unbalanced braces in '{text}'")))
                    }
                }
            }
        }
        "}" => Err(Error::parameters(format!("unbalanced braces in '{text}'"))),
        other => Ok(Literal::Scalar(other.to_string())),
    }
}

/// Decode `text` into the bytes of a value of type `descriptor`.
///
/// An empty literal yields zero bytes of the right size.
pub fn encode_default(
    descriptor: &TypeDescriptor,
    text: &str,
    types: &TypeRegistry,
) -> Result<Vec<u8>> {
    let mut out = vec![0u8; descriptor.byte_size()];
    if text.trim().is_empty() {
        return Ok(out);
    }
    let literal = Literal::parse(text)?;
    encode_into(descriptor, &literal, types, &mut out)?;
    Ok(out)
}

fn encode_into(
    descriptor: &TypeDescriptor,
    literal: &Literal,
    types: &TypeRegistry,
    out: &mut [u8],
) -> Result<()> {
    match descriptor.kind {
        TypeKind::Basic(basic) => {
            if descriptor.shape.is_empty() {
                return match literal {
                    Literal::Scalar(s) => encode_basic(basic, s, out),
                    Literal::List(_) => Err(Error::parameters(format!(
                        "array literal given for scalar {}",
                        basic.name()
                    ))),
                };
            }
            check_shape(literal, &descriptor.shape)?;
            let mut flat = Vec::with_capacity(descriptor.number_of_elements());
            literal.flatten(&mut flat);
            if flat.len() != descriptor.number_of_elements() {
                return Err(Error::parameters(format!(
                    "{} values given for {} elements",
                    flat.len(),
                    descriptor.number_of_elements()
                )));
            }
            let size = basic.size();
            for (i, token) in flat.iter().enumerate() {
                encode_basic(basic, token, &mut out[i * size..(i + 1) * size])?;
            }
            Ok(())
        }
        TypeKind::Structured(id) => {
            let structured = types
                .get(id)
                .ok_or_else(|| Error::fatal(format!("structured id {} unknown", id.0)))?;
            let items = match literal {
                Literal::List(items) if items.len() == structured.number_of_members() => items,
                _ => {
                    return Err(Error::parameters(format!(
                        "default of {} needs {} member values",
                        structured.name,
                        structured.number_of_members()
                    )))
                }
            };
            for (member, item) in structured.members().iter().zip(items) {
                let member_desc = types.resolve(&member.member_type_name, &member.shape)?;
                let start = member.byte_offset;
                encode_into(
                    &member_desc,
                    item,
                    types,
                    &mut out[start..start + member.byte_size],
                )?;
            }
            Ok(())
        }
    }
}

/// Nested lists must match the shape; a flat list of every element is also accepted.
fn check_shape(literal: &Literal, shape: &[usize]) -> Result<()> {
    let Literal::List(items) = literal else {
        return Err(Error::parameters("scalar literal given for an array"));
    };
    let all_scalar = items.iter().all(|i| matches!(i, Literal::Scalar(_)));
    if all_scalar && items.len() == shape.iter().product::<usize>() {
        return Ok(());
    }
    if items.len() != shape[0] {
        return Err(Error::parameters(format!(
            "{} values given for a dimension of {}",
            items.len(),
            shape[0]
        )));
    }
    if shape.len() > 1 {
        items.iter().try_for_each(|i| check_shape(i, &shape[1..]))
    } else if all_scalar {
        Ok(())
    } else {
        Err(Error::parameters("too deeply nested array literal"))
    }
}

fn parse_token<T: std::str::FromStr>(token: &str, basic: BasicType) -> Result<T> {
    token.parse::<T>().map_err(|_| {
        Error::parameters(format!("'{token}' is not a valid {} value", basic.name()))
    })
}

fn encode_basic(basic: BasicType, token: &str, out: &mut [u8]) -> Result<()> {
    let token = token.trim();
    match basic {
        BasicType::UInt8 => parse_token::<u8>(token, basic)?.write_ne(out),
        BasicType::Int8 => parse_token::<i8>(token, basic)?.write_ne(out),
        BasicType::UInt16 => parse_token::<u16>(token, basic)?.write_ne(out),
        BasicType::Int16 => parse_token::<i16>(token, basic)?.write_ne(out),
        BasicType::UInt32 => parse_token::<u32>(token, basic)?.write_ne(out),
        BasicType::Int32 => parse_token::<i32>(token, basic)?.write_ne(out),
        BasicType::UInt64 => parse_token::<u64>(token, basic)?.write_ne(out),
        BasicType::Int64 => parse_token::<i64>(token, basic)?.write_ne(out),
        BasicType::Float32 => parse_token::<f32>(token, basic)?.write_ne(out),
        BasicType::Float64 => parse_token::<f64>(token, basic)?.write_ne(out),
        BasicType::Bool => match token {
            "true" | "1" => true.write_ne(out),
            "false" | "0" => false.write_ne(out),
            _ => {
                return Err(Error::parameters(format!("'{token}' is not a valid bool value")))
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u32s(bytes: &[u8]) -> Vec<u32> {
        bytes.chunks(4).map(u32::read_ne).collect()
    }

    #[test]
    fn literal_parsing() {
        assert_eq!(Literal::parse("1").unwrap(), Literal::Scalar("1".into()));
        assert_eq!(
            Literal::parse("{1, {2 3}}").unwrap(),
            Literal::List(vec![
                Literal::Scalar("1".into()),
                Literal::List(vec![Literal::Scalar("2".into()), Literal::Scalar("3".into())]),
            ])
        );
        assert!(Literal::parse("{1, 2").is_err());
        assert!(Literal::parse("1 2").is_err());
        assert!(Literal::parse("}").is_err());
    }

    #[test]
    fn scalar_and_vector_defaults() {
        let types = TypeRegistry::new();
        let scalar = TypeDescriptor::basic(BasicType::UInt32, vec![]);
        assert_eq!(u32s(&encode_default(&scalar, "1", &types).unwrap()), vec![1]);
        let vector = TypeDescriptor::basic(BasicType::UInt32, vec![2]);
        assert_eq!(u32s(&encode_default(&vector, "{1,2}", &types).unwrap()), vec![1, 2]);
        assert!(encode_default(&vector, "{1}", &types).is_err());
        assert!(encode_default(&scalar, "{1}", &types).is_err());
        assert_eq!(encode_default(&vector, "", &types).unwrap(), vec![0u8; 8]);
    }

    #[test]
    fn matrix_defaults_nested_or_flat() {
        let types = TypeRegistry::new();
        let matrix = TypeDescriptor::basic(BasicType::UInt32, vec![2, 2]);
        let nested = encode_default(&matrix, "{{1,2},{3,4}}", &types).unwrap();
        let flat = encode_default(&matrix, "{1 2 3 4}", &types).unwrap();
        assert_eq!(u32s(&nested), vec![1, 2, 3, 4]);
        assert_eq!(nested, flat);
        assert!(encode_default(&matrix, "{{1,2,3},{4}}", &types).is_err());
    }

    #[test]
    fn range_and_syntax_errors() {
        let types = TypeRegistry::new();
        let byte = TypeDescriptor::basic(BasicType::UInt8, vec![]);
        assert!(encode_default(&byte, "256", &types).is_err());
        assert!(encode_default(&byte, "-1", &types).is_err());
        let flag = TypeDescriptor::basic(BasicType::Bool, vec![]);
        assert_eq!(encode_default(&flag, "true", &types).unwrap(), vec![1]);
        assert!(encode_default(&flag, "yes", &types).is_err());
        let real = TypeDescriptor::basic(BasicType::Float64, vec![]);
        let bytes = encode_default(&real, "-2.5", &types).unwrap();
        assert_eq!(f64::read_ne(&bytes), -2.5);
    }

    #[test]
    fn structured_defaults_follow_introspection() {
        let mut types = TypeRegistry::new();
        types
            .register("TrackError", &[("Par1", "uint32"), ("Par2", "uint32")])
            .unwrap();
        let desc = types.resolve("TrackError", &[]).unwrap();
        let bytes = encode_default(&desc, "{1, 2}", &types).unwrap();
        assert_eq!(u32s(&bytes), vec![1, 2]);
        assert!(encode_default(&desc, "{1}", &types).is_err());
        assert!(encode_default(&desc, "3", &types).is_err());
    }
}
