//! Typed reading of a general-search query string.
//!
//! A general search is written as a collection call, e.g.
//!
//! ```text
//! db['sources'].find({'ra': {'$gt': 10}}, {'_id': 1}).sort('ra', -1).limit(5)
//! db['sources'].aggregate([{'$match': {}}, {'$count': 'n'}])
//! db['sources'].count_documents({})
//! ```
//!
//! [`ReadCall::parse`] turns that text into a closed [`ReadOp`] value. Every
//! argument must be a literal (see [`crate::literal`]), the only chain
//! allowed is `.sort/.skip/.limit` after `find`, and the whole input must be
//! consumed. Anything a read-only surface cannot express is unrepresentable.

use serde_json::{Map, Value};

use crate::error::Rejection;
use crate::literal::{Literal, LiteralError, Scanner};

/// A parsed call against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadCall {
    pub collection: String,
    pub op: ReadOp,
}

/// Options of a `find` call. `limit: None` returns everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Map<String, Value>,
    pub projection: Option<Map<String, Value>>,
    pub sort: Vec<(String, i32)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// The read operations a general search can express.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOp {
    Find(FindOptions),
    FindOne {
        filter: Map<String, Value>,
        projection: Option<Map<String, Value>>,
    },
    CountDocuments {
        filter: Map<String, Value>,
    },
    Distinct {
        key: String,
        filter: Map<String, Value>,
    },
    Aggregate {
        pipeline: Vec<Map<String, Value>>,
    },
    IndexInformation,
    MapReduce {
        map: String,
        reduce: String,
        out: Value,
    },
}

impl ReadOp {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Find(_) => "find",
            Self::FindOne { .. } => "find_one",
            Self::CountDocuments { .. } => "count_documents",
            Self::Distinct { .. } => "distinct",
            Self::Aggregate { .. } => "aggregate",
            Self::IndexInformation => "index_information",
            Self::MapReduce { .. } => "map_reduce",
        }
    }
}

impl ReadCall {
    pub fn parse(src: &str) -> Result<Self, Rejection> {
        let mut scanner = Scanner::new(src);
        let call = parse_call(&mut scanner).map_err(|err| Rejection::InvalidLiteral {
            field: "query".to_string(),
            source: err,
        })?;
        scanner.skip_ws();
        if !scanner.at_end() {
            return Err(Rejection::Malformed(format!(
                "unexpected input at offset {}",
                scanner.offset()
            )));
        }
        Ok(call)
    }
}

fn parse_call(s: &mut Scanner<'_>) -> Result<ReadCall, LiteralError> {
    match s.identifier() {
        Some("db") => {}
        _ => return Err(s.error("query must start with `db[...]`")),
    }
    s.expect('[')?;
    let name_offset = s.offset();
    let collection = match s.literal()? {
        Literal::Str(name) if !name.is_empty() => name,
        _ => {
            return Err(LiteralError {
                offset: name_offset,
                message: "collection name must be a non-empty string".to_string(),
            })
        }
    };
    s.expect(']')?;

    let (verb, args) = method(s)?;
    let mut op = bind(s, verb, args)?;

    while let ReadOp::Find(ref mut find) = op {
        s.skip_ws();
        if s.peek() != Some('.') {
            break;
        }
        let (modifier, args) = method(s)?;
        apply_cursor_modifier(s, find, modifier, args)?;
    }

    Ok(ReadCall { collection, op })
}

struct Args {
    positional: Vec<Literal>,
    keywords: Vec<(String, Literal)>,
}

impl Args {
    /// Argument `name` given either at `index` or as a keyword, not both.
    fn take(
        &mut self,
        s: &Scanner<'_>,
        index: usize,
        name: &str,
    ) -> Result<Option<Literal>, LiteralError> {
        let keyword = self.take_keyword(name);
        match (self.positional.get_mut(index), keyword) {
            (Some(slot), None) => Ok(Some(std::mem::replace(slot, Literal::None))),
            (None, kw) => Ok(kw),
            (Some(_), Some(_)) => Err(s.error(format!("multiple values for argument `{name}`"))),
        }
    }

    fn take_keyword(&mut self, name: &str) -> Option<Literal> {
        self.keywords
            .iter()
            .position(|(k, _)| k == name)
            .map(|i| self.keywords.remove(i).1)
    }
}

/// `.name(args)`
fn method<'a>(s: &mut Scanner<'a>) -> Result<(&'a str, Args), LiteralError> {
    s.expect('.')?;
    let name = s
        .identifier()
        .ok_or_else(|| s.error("expected a method name"))?;
    s.expect('(')?;
    let mut args = Args {
        positional: Vec::new(),
        keywords: Vec::new(),
    };
    loop {
        if s.eat(')') {
            break;
        }
        if let Some(kw) = s.peek_keyword_argument() {
            s.identifier();
            s.expect('=')?;
            if args.keywords.iter().any(|(k, _)| k == kw) {
                return Err(s.error(format!("duplicate keyword argument `{kw}`")));
            }
            let value = s.literal()?;
            args.keywords.push((kw.to_string(), value));
        } else {
            if !args.keywords.is_empty() {
                return Err(s.error("positional argument follows keyword argument"));
            }
            args.positional.push(s.literal()?);
        }
        if s.eat(',') {
            continue;
        }
        s.expect(')')?;
        break;
    }
    Ok((name, args))
}

fn bind(s: &Scanner<'_>, verb: &str, mut args: Args) -> Result<ReadOp, LiteralError> {
    let (max_positional, op) = match verb {
        "find" => {
            let filter = filter_arg(s, args.take(s, 0, "filter")?)?;
            let projection = projection_arg(s, args.take(s, 1, "projection")?)?;
            let mut find = FindOptions {
                filter,
                projection,
                ..FindOptions::default()
            };
            if let Some(v) = args.take_keyword("skip") {
                find.skip = count_arg(s, "skip", &v)?;
            }
            if let Some(v) = args.take_keyword("limit") {
                find.limit = limit_arg(s, &v)?;
            }
            if let Some(v) = args.take_keyword("sort") {
                find.sort = sort_arg(s, &v, None)?;
            }
            (2, ReadOp::Find(find))
        }
        "find_one" => (
            2,
            ReadOp::FindOne {
                filter: filter_arg(s, args.take(s, 0, "filter")?)?,
                projection: projection_arg(s, args.take(s, 1, "projection")?)?,
            },
        ),
        "count_documents" => {
            let filter = match args.take(s, 0, "filter")? {
                Some(v) => filter_arg(s, Some(v))?,
                None => return Err(s.error("count_documents requires a filter")),
            };
            (1, ReadOp::CountDocuments { filter })
        }
        "distinct" => {
            let key = match args.take(s, 0, "key")? {
                Some(Literal::Str(key)) => key,
                _ => return Err(s.error("distinct requires a string key")),
            };
            let filter = filter_arg(s, args.take(s, 1, "filter")?)?;
            (2, ReadOp::Distinct { key, filter })
        }
        "aggregate" => {
            let pipeline = match args.take(s, 0, "pipeline")? {
                Some(Literal::List(stages)) | Some(Literal::Tuple(stages)) => stages
                    .iter()
                    .map(|stage| match stage.to_json() {
                        Value::Object(map) => Ok(map),
                        _ => Err(s.error("each pipeline stage must be a mapping")),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => return Err(s.error("aggregate requires a list of stages")),
            };
            (1, ReadOp::Aggregate { pipeline })
        }
        "index_information" => (0, ReadOp::IndexInformation),
        "map_reduce" => {
            let map = string_arg(s, "map", args.take(s, 0, "map")?)?;
            let reduce = string_arg(s, "reduce", args.take(s, 1, "reduce")?)?;
            let out = args
                .take(s, 2, "out")?
                .map(|v| v.to_json())
                .ok_or_else(|| s.error("map_reduce requires `out`"))?;
            (3, ReadOp::MapReduce { map, reduce, out })
        }
        other => return Err(s.error(format!("`{other}` is not a permitted read operation"))),
    };
    if args.positional.len() > max_positional {
        return Err(s.error(format!("too many arguments to `{verb}`")));
    }
    if let Some((name, _)) = args.keywords.first() {
        return Err(s.error(format!("unexpected keyword argument `{name}` to `{verb}`")));
    }
    Ok(op)
}

fn apply_cursor_modifier(
    s: &Scanner<'_>,
    find: &mut FindOptions,
    modifier: &str,
    mut args: Args,
) -> Result<(), LiteralError> {
    if !args.keywords.is_empty() {
        return Err(s.error(format!("`{modifier}` takes positional arguments only")));
    }
    match (modifier, args.positional.len()) {
        ("sort", 1) => find.sort = sort_arg(s, &args.positional[0], None)?,
        ("sort", 2) => {
            let direction = args.positional.remove(1);
            find.sort = sort_arg(s, &args.positional[0], Some(&direction))?;
        }
        ("skip", 1) => find.skip = count_arg(s, "skip", &args.positional[0])?,
        ("limit", 1) => find.limit = limit_arg(s, &args.positional[0])?,
        ("sort" | "skip" | "limit", n) => {
            return Err(s.error(format!("wrong number of arguments ({n}) to `{modifier}`")))
        }
        (other, _) => return Err(s.error(format!("`{other}` cannot follow `find`"))),
    }
    Ok(())
}

fn filter_arg(s: &Scanner<'_>, value: Option<Literal>) -> Result<Map<String, Value>, LiteralError> {
    match value {
        None | Some(Literal::None) => Ok(Map::new()),
        Some(lit @ Literal::Dict(_)) => match lit.to_json() {
            Value::Object(map) => Ok(map),
            _ => Err(s.error("filter must be a mapping")),
        },
        Some(other) => Err(s.error(format!("filter must be a mapping, got {}", other.kind()))),
    }
}

fn projection_arg(
    s: &Scanner<'_>,
    value: Option<Literal>,
) -> Result<Option<Map<String, Value>>, LiteralError> {
    match value {
        None | Some(Literal::None) => Ok(None),
        Some(lit @ Literal::Dict(_)) => match lit.to_json() {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(s.error("projection must be a mapping")),
        },
        Some(Literal::List(fields)) | Some(Literal::Tuple(fields)) => {
            let mut map = Map::new();
            for field in fields {
                match field {
                    Literal::Str(name) => {
                        map.insert(name, Value::from(1));
                    }
                    other => {
                        return Err(s.error(format!(
                            "projection field names must be strings, got {}",
                            other.kind()
                        )))
                    }
                }
            }
            Ok(Some(map))
        }
        Some(other) => Err(s.error(format!(
            "projection must be a mapping or list, got {}",
            other.kind()
        ))),
    }
}

fn string_arg(s: &Scanner<'_>, name: &str, value: Option<Literal>) -> Result<String, LiteralError> {
    match value {
        Some(Literal::Str(text)) => Ok(text),
        _ => Err(s.error(format!("`{name}` must be a string"))),
    }
}

fn count_arg(s: &Scanner<'_>, name: &str, value: &Literal) -> Result<usize, LiteralError> {
    match value {
        Literal::Int(n) if *n >= 0 => Ok(*n as usize),
        _ => Err(s.error(format!("`{name}` must be a non-negative integer"))),
    }
}

fn limit_arg(s: &Scanner<'_>, value: &Literal) -> Result<Option<usize>, LiteralError> {
    match count_arg(s, "limit", value)? {
        0 => Ok(None),
        n => Ok(Some(n)),
    }
}

/// `sort('key', -1)`, `sort('key')`, or `sort([('a', 1), ('b', -1)])`.
fn sort_arg(
    s: &Scanner<'_>,
    key_or_list: &Literal,
    direction: Option<&Literal>,
) -> Result<Vec<(String, i32)>, LiteralError> {
    let dir = |lit: &Literal| match lit {
        Literal::Int(1) => Ok(1),
        Literal::Int(-1) => Ok(-1),
        _ => Err(s.error("sort direction must be 1 or -1")),
    };
    match key_or_list {
        Literal::Str(key) => {
            let d = match direction {
                Some(d) => dir(d)?,
                None => 1,
            };
            Ok(vec![(key.clone(), d)])
        }
        Literal::List(pairs) | Literal::Tuple(pairs) if direction.is_none() => pairs
            .iter()
            .map(|pair| match pair.as_sequence() {
                Some([Literal::Str(key), d]) => Ok((key.clone(), dir(d)?)),
                _ => Err(s.error("sort keys must be (name, direction) pairs")),
            })
            .collect(),
        _ => Err(s.error("invalid sort specification")),
    }
}
