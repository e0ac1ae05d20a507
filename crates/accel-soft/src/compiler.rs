//! Front end of the reference device compiler.
//!
//! The reference device does not generate code: kernel bodies are host closures registered by
//! entry-point name. Building a program therefore means preprocessing the source, checking it is
//! structurally sound, and extracting the `__kernel` entry points (parameter kinds and any
//! `reqd_work_group_size` attribute) so launches can be validated.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

const SOURCE_NAME: &str = "<source>";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct BuildOptions {
    defines: HashMap<String, String>,
    warnings_as_errors: bool,
    suppress_warnings: bool,
}

/// Parses a build option string. Unknown options are rejected.
pub(crate) fn parse_options(options: &str) -> Result<BuildOptions, String> {
    let mut out = BuildOptions::default();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-D" => {
                let def = tokens
                    .next()
                    .ok_or_else(|| "missing macro name after '-D'".to_owned())?;
                out.define(def);
            }
            "-I" => {
                tokens
                    .next()
                    .ok_or_else(|| "missing path after '-I'".to_owned())?;
            }
            "-w" => out.suppress_warnings = true,
            "-Werror" => out.warnings_as_errors = true,
            _ if token.starts_with("-D") => out.define(&token[2..]),
            _ if token.starts_with("-I") || token.starts_with("-cl-") => {}
            _ => return Err(format!("unrecognized build option '{token}'")),
        }
    }
    Ok(out)
}

impl BuildOptions {
    fn define(&mut self, def: &str) {
        let (name, value) = def.split_once('=').unwrap_or((def, "1"));
        self.defines.insert(name.to_owned(), value.to_owned());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParamKind {
    /// `__global` / `__constant` pointer.
    GlobalPtr,
    LocalPtr,
    Image2d,
    /// By-value argument; `size` is `None` for types the front end cannot size (structs).
    Scalar { type_name: String, size: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Param {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntryPoint {
    pub name: String,
    pub params: Vec<Param>,
    pub reqd_work_group_size: Option<[usize; 3]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Compiled {
    pub entry_points: Vec<EntryPoint>,
    pub log: String,
}

/// Compiles `source`. On failure the returned string is the build log.
pub(crate) fn compile(
    source: &str,
    options: &BuildOptions,
    has_body: impl Fn(&str) -> bool,
) -> Result<Compiled, String> {
    let mut diags = Diagnostics::new(options);

    let stripped = strip_comments(source, &mut diags);
    let lines = preprocess(&stripped, options, &mut diags);
    if diags.has_errors() {
        return Err(diags.into_log());
    }

    let tokens = tokenize(&lines);
    check_brackets(&tokens, &mut diags);
    if diags.has_errors() {
        return Err(diags.into_log());
    }

    let entry_points = entry_points(&tokens, &mut diags);
    let mut seen = HashSet::new();
    for entry in &entry_points {
        if !seen.insert(entry.name.as_str()) {
            diags.error(None, format!("redefinition of kernel '{}'", entry.name));
        }
        if entry.params.is_empty() {
            diags.warning(None, format!("kernel '{}' takes no arguments", entry.name));
        }
        if !has_body(&entry.name) {
            diags.warning(
                None,
                format!(
                    "no device implementation registered for kernel '{}'; launches will fail",
                    entry.name
                ),
            );
        }
    }

    if diags.has_errors() {
        return Err(diags.into_log());
    }
    Ok(Compiled {
        entry_points,
        log: diags.into_log(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pos {
    line: usize,
    col: usize,
}

struct Diagnostics {
    log: String,
    errors: usize,
    warnings_as_errors: bool,
    suppress_warnings: bool,
}

impl Diagnostics {
    fn new(options: &BuildOptions) -> Self {
        Self {
            log: String::new(),
            errors: 0,
            warnings_as_errors: options.warnings_as_errors,
            suppress_warnings: options.suppress_warnings,
        }
    }

    fn error(&mut self, pos: Option<Pos>, msg: String) {
        self.errors += 1;
        self.push(pos, "error", &msg);
    }

    fn warning(&mut self, pos: Option<Pos>, msg: String) {
        if self.warnings_as_errors {
            self.error(pos, format!("{msg} [-Werror]"));
        } else if !self.suppress_warnings {
            self.push(pos, "warning", &msg);
        }
    }

    fn push(&mut self, pos: Option<Pos>, severity: &str, msg: &str) {
        let _ = match pos {
            Some(pos) => writeln!(
                self.log,
                "{SOURCE_NAME}:{}:{}: {severity}: {msg}",
                pos.line, pos.col
            ),
            None => writeln!(self.log, "{SOURCE_NAME}: {severity}: {msg}"),
        };
    }

    fn has_errors(&self) -> bool {
        self.errors > 0
    }

    fn into_log(self) -> String {
        self.log
    }
}

/// Blanks out comments, keeping line and column positions intact.
fn strip_comments(source: &str, diags: &mut Diagnostics) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let (mut line, mut col) = (1, 1);
    let mut block_start: Option<Pos> = None;

    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        if block_start.is_some() {
            if c == '*' && next == Some('/') {
                chars.next();
                out.push_str("  ");
                col += 2;
                block_start = None;
                continue;
            }
        } else if c == '/' && next == Some('/') {
            while let Some(&n) = chars.peek() {
                if n == '\n' {
                    break;
                }
                chars.next();
                out.push(' ');
            }
            out.push(' ');
            col += 1;
            continue;
        } else if c == '/' && next == Some('*') {
            block_start = Some(Pos { line, col });
            chars.next();
            out.push_str("  ");
            col += 2;
            continue;
        }

        if c == '\n' {
            out.push('\n');
            line += 1;
            col = 1;
        } else {
            out.push(if block_start.is_some() { ' ' } else { c });
            col += 1;
        }
    }

    if let Some(pos) = block_start {
        diags.error(Some(pos), "unterminated /* comment".to_owned());
    }
    out
}

struct Conditional {
    active: bool,
    parent_active: bool,
    taken: bool,
    seen_else: bool,
    pos: Pos,
}

/// Runs the line-oriented preprocessor; inactive and directive lines come back empty so line
/// numbers stay aligned with the input.
fn preprocess(source: &str, options: &BuildOptions, diags: &mut Diagnostics) -> Vec<String> {
    let mut defines = options.defines.clone();
    let mut stack: Vec<Conditional> = Vec::new();
    let mut lines = Vec::new();

    for (index, raw_line) in source.lines().enumerate() {
        let active = stack.last().map_or(true, |c| c.active);
        let trimmed = raw_line.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            lines.push(if active { raw_line.to_owned() } else { String::new() });
            continue;
        };
        lines.push(String::new());

        let pos = Pos {
            line: index + 1,
            col: raw_line.len() - trimmed.len() + 1,
        };
        let directive = directive.trim();
        let (word, rest) = directive
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((directive, ""));

        match word {
            "ifdef" | "ifndef" | "if" => {
                let cond = match word {
                    "ifdef" => defines.contains_key(rest),
                    "ifndef" => !defines.contains_key(rest),
                    _ => match eval_if(rest, &defines) {
                        Some(value) => value,
                        None => {
                            if active {
                                diags.error(
                                    Some(pos),
                                    format!("unsupported #if expression '{rest}'"),
                                );
                            }
                            false
                        }
                    },
                };
                stack.push(Conditional {
                    active: active && cond,
                    parent_active: active,
                    taken: cond,
                    seen_else: false,
                    pos,
                });
            }
            "else" => match stack.last_mut() {
                Some(c) if !c.seen_else => {
                    c.seen_else = true;
                    c.active = c.parent_active && !c.taken;
                    c.taken = true;
                }
                Some(_) => diags.error(Some(pos), "#else after #else".to_owned()),
                None => diags.error(Some(pos), "#else without #if".to_owned()),
            },
            "endif" => {
                if stack.pop().is_none() {
                    diags.error(Some(pos), "#endif without #if".to_owned());
                }
            }
            _ if !active => {}
            "define" => {
                let mut parts = rest.splitn(2, char::is_whitespace);
                match parts.next().filter(|name| !name.is_empty()) {
                    Some(name) => {
                        let value = parts.next().unwrap_or("").trim().to_owned();
                        defines.insert(name.to_owned(), value);
                    }
                    None => diags.error(Some(pos), "macro name missing".to_owned()),
                }
            }
            "undef" => {
                defines.remove(rest);
            }
            "error" => diags.error(Some(pos), format!("#error {rest}")),
            "warning" => diags.warning(Some(pos), format!("#warning {rest}")),
            "include" | "pragma" | "line" | "" => {}
            other => diags.error(
                Some(pos),
                format!("invalid preprocessing directive #{other}"),
            ),
        }
    }

    for open in stack {
        diags.error(Some(open.pos), "unterminated conditional directive".to_owned());
    }
    lines
}

fn eval_if(expr: &str, defines: &HashMap<String, String>) -> Option<bool> {
    let expr = expr.trim();
    if let Some(negated) = expr.strip_prefix('!') {
        return eval_if(negated, defines).map(|v| !v);
    }
    if let Some(inner) = expr
        .strip_prefix("defined")
        .map(str::trim)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
    {
        return Some(defines.contains_key(inner.trim()));
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Some(value != 0);
    }
    defines
        .get(expr)
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(|value| value != 0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Ident(String),
    Number(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: Pos,
}

impl Token {
    fn is_ident(&self, s: &str) -> bool {
        matches!(&self.tok, Tok::Ident(i) if i == s)
    }

    fn is_punct(&self, c: char) -> bool {
        self.tok == Tok::Punct(c)
    }

    fn ident(&self) -> Option<&str> {
        match &self.tok {
            Tok::Ident(i) => Some(i),
            _ => None,
        }
    }
}

fn tokenize(lines: &[String]) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let pos = Pos {
                line: index + 1,
                col: i + 1,
            };
            if c.is_whitespace() {
                i += 1;
            } else if c.is_ascii_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(chars[start..i].iter().collect()),
                    pos,
                });
            } else if c.is_ascii_digit() {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Number(chars[start..i].iter().collect()),
                    pos,
                });
            } else if c == '"' || c == '\'' {
                i += 1;
                while i < chars.len() && chars[i] != c {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            } else {
                tokens.push(Token {
                    tok: Tok::Punct(c),
                    pos,
                });
                i += 1;
            }
        }
    }
    tokens
}

fn closing(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn check_brackets(tokens: &[Token], diags: &mut Diagnostics) {
    let mut stack: Vec<(char, Pos)> = Vec::new();
    for token in tokens {
        let Tok::Punct(c) = token.tok else { continue };
        match c {
            '(' | '[' | '{' => stack.push((c, token.pos)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing(open) == c => {}
                Some((open, _)) => {
                    diags.error(
                        Some(token.pos),
                        format!("expected '{}' before '{c}'", closing(open)),
                    );
                    return;
                }
                None => {
                    diags.error(Some(token.pos), format!("extraneous closing '{c}'"));
                    return;
                }
            },
            _ => {}
        }
    }
    if let Some((open, pos)) = stack.pop() {
        diags.error(Some(pos), format!("unmatched '{open}'"));
    }
}

/// Index of the token closing the bracket opened at `open`. Brackets are known to balance.
fn matching(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.tok {
            Tok::Punct('(') | Tok::Punct('[') | Tok::Punct('{') => depth += 1,
            Tok::Punct(')') | Tok::Punct(']') | Tok::Punct('}') => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
    }
    tokens.len().saturating_sub(1)
}

fn entry_points(tokens: &[Token], diags: &mut Diagnostics) -> Vec<EntryPoint> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if !(tokens[i].is_ident("__kernel") || tokens[i].is_ident("kernel")) {
            i += 1;
            continue;
        }
        let kernel_pos = tokens[i].pos;
        let mut j = i + 1;
        let mut reqd = None;
        while j < tokens.len() && tokens[j].is_ident("__attribute__") {
            if !tokens.get(j + 1).is_some_and(|t| t.is_punct('(')) {
                break;
            }
            let end = matching(tokens, j + 1);
            reqd = reqd.or_else(|| reqd_work_group_size(&tokens[j + 1..end]));
            j = end + 1;
        }

        match tokens.get(j) {
            Some(t) if t.is_ident("void") => {}
            Some(t) => {
                diags.error(Some(t.pos), "kernel functions must return void".to_owned());
                i = j;
                continue;
            }
            None => {
                diags.error(Some(kernel_pos), "expected kernel declaration".to_owned());
                break;
            }
        }
        let Some(name) = tokens.get(j + 1).and_then(Token::ident) else {
            diags.error(Some(kernel_pos), "expected kernel name".to_owned());
            i = j + 1;
            continue;
        };
        if !tokens.get(j + 2).is_some_and(|t| t.is_punct('(')) {
            diags.error(
                Some(tokens[j + 1].pos),
                format!("expected '(' after kernel name '{name}'"),
            );
            i = j + 2;
            continue;
        }
        let close = matching(tokens, j + 2);
        let params = parse_params(&tokens[j + 3..close]);

        // Prototypes (`;` instead of a body) do not define an entry point.
        if tokens.get(close + 1).is_some_and(|t| t.is_punct('{')) {
            out.push(EntryPoint {
                name: name.to_owned(),
                params,
                reqd_work_group_size: reqd,
            });
        }
        i = close + 1;
    }
    out
}

fn reqd_work_group_size(attr: &[Token]) -> Option<[usize; 3]> {
    let at = attr
        .iter()
        .position(|t| t.is_ident("reqd_work_group_size"))?;
    let values: Vec<usize> = attr[at + 1..]
        .iter()
        .take_while(|t| !t.is_punct(')'))
        .filter_map(|t| match &t.tok {
            Tok::Number(n) => n.trim_end_matches(['u', 'U']).parse().ok(),
            _ => None,
        })
        .collect();
    match values.as_slice() {
        &[x, y, z] => Some([x, y, z]),
        _ => None,
    }
}

const QUALIFIERS: &[&str] = &[
    "__global", "global", "__constant", "constant", "__local", "local", "__private", "private",
    "const", "restrict", "volatile", "__read_only", "read_only", "__write_only", "write_only",
    "__read_write", "read_write", "struct",
];

fn parse_params(tokens: &[Token]) -> Vec<Param> {
    if tokens.is_empty() || (tokens.len() == 1 && tokens[0].is_ident("void")) {
        return Vec::new();
    }

    let mut params = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        match token.tok {
            Tok::Punct('(') | Tok::Punct('[') => depth += 1,
            Tok::Punct(')') | Tok::Punct(']') => depth = depth.saturating_sub(1),
            Tok::Punct(',') if depth == 0 => {
                params.push(parse_param(&tokens[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    params.push(parse_param(&tokens[start..]));
    params
}

fn parse_param(tokens: &[Token]) -> Param {
    let idents: Vec<&str> = tokens.iter().filter_map(Token::ident).collect();
    let name = idents.last().copied().unwrap_or("").to_owned();
    let is_pointer = tokens.iter().any(|t| t.is_punct('*'));
    let is_local = idents.iter().any(|i| matches!(*i, "__local" | "local"));

    let kind = if is_pointer && is_local {
        ParamKind::LocalPtr
    } else if is_pointer {
        ParamKind::GlobalPtr
    } else if idents.contains(&"image2d_t") {
        ParamKind::Image2d
    } else {
        let type_words: Vec<&str> = idents[..idents.len().saturating_sub(1)]
            .iter()
            .copied()
            .filter(|i| !QUALIFIERS.contains(i))
            .collect();
        let type_name = type_words.join(" ");
        ParamKind::Scalar {
            size: scalar_size(&type_name),
            type_name,
        }
    };
    Param { name, kind }
}

fn scalar_size(type_name: &str) -> Option<usize> {
    let base = match type_name {
        "unsigned" | "signed" | "unsigned int" | "signed int" => return Some(4),
        "unsigned char" | "signed char" => return Some(1),
        "unsigned short" | "signed short" => return Some(2),
        "unsigned long" | "signed long" => return Some(8),
        other => other,
    };
    let digits_at = base
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(base.len());
    let (scalar, lanes) = base.split_at(digits_at);
    let elem = match scalar {
        "bool" | "char" | "uchar" => 1,
        "short" | "ushort" | "half" => 2,
        "int" | "uint" | "float" => 4,
        "long" | "ulong" | "double" | "size_t" | "ptrdiff_t" | "intptr_t" | "uintptr_t"
        | "sampler_t" => 8,
        _ => return None,
    };
    let lanes = match lanes {
        "" => 1,
        "2" => 2,
        "3" | "4" => 4,
        "8" => 8,
        "16" => 16,
        _ => return None,
    };
    Some(elem * lanes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(source: &str, options: &str) -> Result<Compiled, String> {
        compile(source, &parse_options(options).unwrap(), |_| true)
    }

    #[test]
    fn extracts_entry_points_and_param_kinds() {
        let compiled = build(
            r#"
            // helper, not an entry point
            float sq(float x) { return x * x; }

            __kernel __attribute__((reqd_work_group_size(16, 1, 1)))
            void square(__global const float *a, __global float *b, uint n) {
                size_t i = get_global_id(0);
                if (i < n) b[i] = sq(a[i]);
            }

            kernel void scratch(__local float *tmp, float4 scale, read_only image2d_t img) { }
            "#,
            "",
        )
        .unwrap();

        assert_eq!(compiled.entry_points.len(), 2);
        let square = &compiled.entry_points[0];
        assert_eq!(square.name, "square");
        assert_eq!(square.reqd_work_group_size, Some([16, 1, 1]));
        assert_eq!(square.params[0].kind, ParamKind::GlobalPtr);
        assert_eq!(square.params[1].name, "b");
        assert_eq!(
            square.params[2].kind,
            ParamKind::Scalar {
                type_name: "uint".into(),
                size: Some(4)
            }
        );

        let scratch = &compiled.entry_points[1];
        assert_eq!(scratch.params[0].kind, ParamKind::LocalPtr);
        assert_eq!(
            scratch.params[1].kind,
            ParamKind::Scalar {
                type_name: "float4".into(),
                size: Some(16)
            }
        );
        assert_eq!(scratch.params[2].kind, ParamKind::Image2d);
        assert!(compiled.log.is_empty(), "{}", compiled.log);
    }

    #[test]
    fn unbalanced_source_reports_position() {
        let log = build("__kernel void f(__global int *a) {\n  a[0] = 1;\n", "").unwrap_err();
        assert!(log.contains("<source>:1:34: error: unmatched '{'"), "{log}");

        let log = build("__kernel void f(int a)) { }", "").unwrap_err();
        assert!(log.contains("extraneous closing ')'"), "{log}");
    }

    #[test]
    fn preprocessor_honours_defines_and_error() {
        let source = "#ifndef WIDTH\n#error WIDTH must be defined\n#endif\n__kernel void f(int a) {}\n";
        let log = build(source, "").unwrap_err();
        assert!(log.contains("<source>:2:1: error: #error WIDTH must be defined"), "{log}");

        let compiled = build(source, "-D WIDTH=64").unwrap();
        assert_eq!(compiled.entry_points[0].name, "f");
        assert!(build(source, "-DWIDTH").is_ok());
    }

    #[test]
    fn inactive_branches_are_skipped() {
        let source = "#if 0\n__kernel void hidden(int a) {}\n#else\n__kernel void shown(int a) {}\n#endif\n";
        let compiled = build(source, "").unwrap();
        let names: Vec<_> = compiled.entry_points.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["shown"]);

        let log = build("#ifdef X\n__kernel void f(int a) {}\n", "").unwrap_err();
        assert!(log.contains("unterminated conditional directive"), "{log}");
    }

    #[test]
    fn warnings_can_be_promoted_or_silenced() {
        let source = "__kernel void empty(void) {}\n";
        let compiled = build(source, "").unwrap();
        assert!(compiled.log.contains("warning: kernel 'empty' takes no arguments"));

        assert!(build(source, "-w").unwrap().log.is_empty());

        let log = build(source, "-Werror").unwrap_err();
        assert!(log.contains("error: kernel 'empty' takes no arguments [-Werror]"), "{log}");
    }

    #[test]
    fn missing_body_is_a_warning() {
        let compiled = compile(
            "__kernel void f(int a) {}",
            &BuildOptions::default(),
            |_| false,
        )
        .unwrap();
        assert!(compiled.log.contains("no device implementation registered for kernel 'f'"));
    }

    #[test]
    fn rejects_unknown_options_and_bad_kernels() {
        assert!(parse_options("-cl-fast-relaxed-math -I include -DX=1 -w").is_ok());
        assert_eq!(
            parse_options("--fast").unwrap_err(),
            "unrecognized build option '--fast'"
        );

        let log = build("__kernel int f(int a) { return a; }", "").unwrap_err();
        assert!(log.contains("kernel functions must return void"), "{log}");

        let log = build("__kernel void f(int a) {}\n__kernel void f(int b) {}", "").unwrap_err();
        assert!(log.contains("redefinition of kernel 'f'"), "{log}");
    }

    #[test]
    fn prototypes_are_not_entry_points() {
        let compiled = build("__kernel void f(int a);\n__kernel void g(int a) {}", "").unwrap();
        assert_eq!(compiled.entry_points.len(), 1);
        assert_eq!(compiled.entry_points[0].name, "g");
    }
}
