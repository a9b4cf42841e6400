//! Text rendering: reprs, format specs (`f"{x:>8.2f}"`), `%` formatting and
//! `str.format`.

use super::error::Fault;
use super::value::Value;

/// Shortest round-trip float text, always with a decimal point or exponent.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        return python_exponent(&format!("{f:e}"));
    }
    let text = f.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

/// Rust writes `1.5e3` / `1e-7`; the language shows `1.5e+03` / `1e-07`.
fn python_exponent(text: &str) -> String {
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => text.to_string(),
    }
}

/// Quote a string the way `repr()` does.
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

#[derive(Debug, Clone, PartialEq)]
struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    ty: Option<char>,
}

impl FormatSpec {
    fn parse(spec: &str) -> Result<Self, Fault> {
        let chars: Vec<char> = spec.chars().collect();
        let mut i = 0;
        let mut parsed = FormatSpec {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            width: 0,
            grouping: None,
            precision: None,
            ty: None,
        };
        let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');

        if chars.len() >= 2 && is_align(chars[1]) {
            parsed.fill = chars[0];
            parsed.align = Some(chars[1]);
            i = 2;
        } else if !chars.is_empty() && is_align(chars[0]) {
            parsed.align = Some(chars[0]);
            i = 1;
        }
        if let Some(&c) = chars.get(i) {
            if matches!(c, '+' | '-' | ' ') {
                parsed.sign = c;
                i += 1;
            }
        }
        if chars.get(i) == Some(&'#') {
            parsed.alternate = true;
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            if parsed.align.is_none() {
                parsed.fill = '0';
                parsed.align = Some('=');
            }
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            parsed.width = chars[start..i]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| Fault::value_error("Too many decimal digits in format string"))?;
        }
        if let Some(&c) = chars.get(i) {
            if c == ',' || c == '_' {
                parsed.grouping = Some(c);
                i += 1;
            }
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            if i == start {
                return Err(Fault::value_error("Format specifier missing precision"));
            }
            parsed.precision = chars[start..i].iter().collect::<String>().parse().ok();
        }
        if let Some(&c) = chars.get(i) {
            parsed.ty = Some(c);
            i += 1;
        }
        if i != chars.len() {
            return Err(Fault::value_error("Invalid format specifier"));
        }
        Ok(parsed)
    }

    fn pad(&self, sign: &str, body: &str, default_align: char) -> String {
        let len = sign.chars().count() + body.chars().count();
        if len >= self.width {
            return format!("{sign}{body}");
        }
        let padding = self.width - len;
        let fill = |n: usize| self.fill.to_string().repeat(n);
        match self.align.unwrap_or(default_align) {
            '<' => format!("{sign}{body}{}", fill(padding)),
            '^' => format!(
                "{}{sign}{body}{}",
                fill(padding / 2),
                fill(padding - padding / 2)
            ),
            '=' => format!("{sign}{}{body}", fill(padding)),
            _ => format!("{}{sign}{body}", fill(padding)),
        }
    }

    fn sign_text(&self, negative: bool) -> &'static str {
        match (negative, self.sign) {
            (true, _) => "-",
            (false, '+') => "+",
            (false, ' ') => " ",
            _ => "",
        }
    }
}

fn group_digits(digits: &str, sep: char) -> String {
    let (int_part, rest) = match digits.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => digits.split_at(pos),
        None => (digits, ""),
    };
    let mut out = String::with_capacity(int_part.len() + int_part.len() / 3 + rest.len());
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            out.push(sep);
        }
        out.push(c);
    }
    out.push_str(rest);
    out
}

fn format_float_body(abs: f64, ty: Option<char>, precision: Option<usize>) -> String {
    match ty {
        Some('f') | Some('F') => format!("{abs:.prec$}", prec = precision.unwrap_or(6)),
        Some('e') | Some('E') => {
            let text = python_exponent(&format!("{abs:.prec$e}", prec = precision.unwrap_or(6)));
            if ty == Some('E') {
                text.to_uppercase()
            } else {
                text
            }
        }
        Some('%') => format!("{:.prec$}%", abs * 100.0, prec = precision.unwrap_or(6)),
        Some('g') | Some('G') => general(abs, precision.unwrap_or(6)),
        _ => match precision {
            Some(p) => general(abs, p),
            None => float_repr(abs),
        },
    }
}

/// `g` presentation: fixed or scientific depending on the exponent,
/// trailing zeros removed.
fn general(abs: f64, precision: usize) -> String {
    if abs.is_nan() || abs.is_infinite() {
        return float_repr(abs);
    }
    let p = precision.max(1);
    if abs == 0.0 {
        return "0".into();
    }
    let exp = abs.log10().floor() as i32;
    let strip = |s: String| {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            s
        }
    };
    if exp < -4 || exp >= p as i32 {
        let text = format!("{abs:.prec$e}", prec = p - 1);
        match text.split_once('e') {
            Some((mantissa, e)) => python_exponent(&format!("{}e{e}", strip(mantissa.to_string()))),
            None => text,
        }
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip(format!("{abs:.decimals$}"))
    }
}

fn format_int(i: i64, spec: &FormatSpec) -> Result<String, Fault> {
    let abs = i.unsigned_abs();
    let body = match spec.ty {
        None | Some('d') | Some('n') => abs.to_string(),
        Some('x') => format!("{}{abs:x}", if spec.alternate { "0x" } else { "" }),
        Some('X') => format!("{}{abs:X}", if spec.alternate { "0X" } else { "" }),
        Some('o') => format!("{}{abs:o}", if spec.alternate { "0o" } else { "" }),
        Some('b') => format!("{}{abs:b}", if spec.alternate { "0b" } else { "" }),
        Some('c') => char::from_u32(i as u32)
            .map(String::from)
            .ok_or_else(Fault::overflow)?,
        Some(ty @ ('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%')) => {
            return Ok(format_float(i as f64, &FormatSpec { ty: Some(ty), ..spec.clone() }))
        }
        Some(other) => {
            return Err(Fault::value_error(format!(
                "Unknown format code '{other}' for object of type 'int'"
            )))
        }
    };
    let body = match spec.grouping {
        Some(sep) => group_digits(&body, sep),
        None => body,
    };
    Ok(spec.pad(spec.sign_text(i < 0), &body, '>'))
}

fn format_float(f: f64, spec: &FormatSpec) -> String {
    let body = format_float_body(f.abs(), spec.ty, spec.precision);
    let body = match spec.grouping {
        Some(sep) => group_digits(&body, sep),
        None => body,
    };
    let negative = f.is_sign_negative() && !f.is_nan() && !(f == 0.0 && spec.ty.is_none());
    spec.pad(spec.sign_text(negative), &body, '>')
}

/// Apply a format spec to a value. `display` is the value's `str()` text,
/// used for non-numeric values.
pub fn format_value(value: &Value, spec: &str, display: &str) -> Result<String, Fault> {
    if spec.is_empty() {
        return Ok(display.to_string());
    }
    let parsed = FormatSpec::parse(spec)?;
    match value {
        Value::Int(i) => format_int(*i, &parsed),
        Value::Bool(b) => format_int(*b as i64, &parsed),
        Value::Float(f) => match parsed.ty {
            None | Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%') => Ok(format_float(*f, &parsed)),
            Some(other) => Err(Fault::value_error(format!(
                "Unknown format code '{other}' for object of type 'float'"
            ))),
        },
        _ => match parsed.ty {
            None | Some('s') => {
                let text: String = match parsed.precision {
                    Some(p) => display.chars().take(p).collect(),
                    None => display.to_string(),
                };
                Ok(parsed.pad("", &text, '<'))
            }
            Some(other) => Err(Fault::value_error(format!(
                "Unknown format code '{other}' for object of type 'str'"
            ))),
        },
    }
}

/// Callbacks the formatting routines need from the interpreter.
pub trait Render {
    fn to_str(&self, value: &Value) -> String;
    fn to_repr(&self, value: &Value) -> String;
}

/// `template % args`.
pub fn percent_format(template: &str, args: &[Value], render: &dyn Render) -> Result<String, Fault> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut align = None;
        let mut flags = String::new();
        while let Some(&f) = chars.peek() {
            match f {
                '-' => align = Some('<'),
                '+' | ' ' => flags.push(f),
                '0' if align.is_none() => flags.push('0'),
                '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        let mut precision = String::new();
        if chars.peek() == Some(&'.') {
            chars.next();
            precision.push('.');
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                chars.next();
            }
        }
        let ty = chars
            .next()
            .ok_or_else(|| Fault::value_error("incomplete format"))?;
        let arg = next_arg
            .next()
            .ok_or_else(|| Fault::type_error("not enough arguments for format string"))?;

        let spec = format!(
            "{}{flags}{width}{precision}",
            align.map(String::from).unwrap_or_default()
        );
        let piece = match ty {
            's' => format_value(&Value::str(render.to_str(arg)), &spec, &render.to_str(arg))?,
            'r' => format_value(&Value::str(render.to_repr(arg)), &spec, &render.to_repr(arg))?,
            'd' | 'i' | 'u' => {
                let n = match arg {
                    Value::Float(f) => Value::Int(f.trunc() as i64),
                    Value::Int(_) | Value::Bool(_) => arg.clone(),
                    _ => {
                        return Err(Fault::type_error(format!(
                            "%{ty} format: a real number is required"
                        )))
                    }
                };
                format_value(&n, &format!("{spec}d"), "")?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => {
                let n = match arg {
                    Value::Int(_) | Value::Float(_) | Value::Bool(_) => arg.clone(),
                    _ => {
                        return Err(Fault::type_error(format!(
                            "%{ty} format: a real number is required"
                        )))
                    }
                };
                format_value(&n, &format!("{spec}{ty}"), "")?
            }
            other => {
                return Err(Fault::value_error(format!(
                    "unsupported format character '{other}'"
                )))
            }
        };
        out.push_str(&piece);
    }

    if next_arg.next().is_some() {
        return Err(Fault::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

/// `template.format(*args, **kwargs)`; field names may be empty (automatic
/// numbering), an index, or a keyword.
pub fn str_format(
    template: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
    render: &dyn Render,
) -> Result<String, Fault> {
    let mut out = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut auto_index = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '}' => return Err(Fault::value_error("Single '}' encountered in format string")),
            '{' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|p| i + p)
                    .ok_or_else(|| Fault::value_error("Single '{' encountered in format string"))?;
                let field: String = chars[i + 1..close].iter().collect();
                let (head, spec) = match field.split_once(':') {
                    Some((h, s)) => (h, s),
                    None => (field.as_str(), ""),
                };
                let (name, conversion) = match head.split_once('!') {
                    Some((n, c)) => (n, c.chars().next()),
                    None => (head, None),
                };

                let value = if name.is_empty() {
                    let v = args.get(auto_index).ok_or_else(|| {
                        Fault::index_error(format!(
                            "Replacement index {auto_index} out of range for positional args tuple"
                        ))
                    })?;
                    auto_index += 1;
                    v
                } else if let Ok(idx) = name.parse::<usize>() {
                    args.get(idx).ok_or_else(|| {
                        Fault::index_error(format!(
                            "Replacement index {idx} out of range for positional args tuple"
                        ))
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v)
                        .ok_or_else(|| Fault::key_error(quote_str(name)))?
                };

                let piece = match conversion {
                    Some('r') | Some('a') => {
                        let text = render.to_repr(value);
                        format_value(&Value::str(text.clone()), spec, &text)?
                    }
                    Some('s') => {
                        let text = render.to_str(value);
                        format_value(&Value::str(text.clone()), spec, &text)?
                    }
                    _ => format_value(value, spec, &render.to_str(value))?,
                };
                out.push_str(&piece);
                i = close + 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}
