//! Standard syscall handlers.
//!
//! Every handler takes its arguments in call order and returns one value.
//! Missing optional arguments read as `Null`.

use super::syscall::{RegisterError, SyscallContext, SyscallError, SyscallResult, SyscallTable};
use crate::data::{DataTree, Number, format_float};
use tracing::{info, trace};

/// Register all standard handlers into `table`.
pub fn install(table: &mut SyscallTable) -> Result<(), RegisterError> {
    table.register("htmlescape", |_, args| unary(args, "htmlescape", |v| html_escape(&v.to_text())))?;
    table.register("urlescape", |_, args| unary(args, "urlescape", |v| url_escape(&v.to_text())))?;
    table.register("jsescape", |_, args| unary(args, "jsescape", |v| js_escape(&v.to_text())))?;
    table.register("json", |_, args| {
        arity(args, "json", 1, 1)?;
        serde_json::to_string(&args[0])
            .map(DataTree::String)
            .map_err(|e| SyscallError::new(format!("json: {e}")))
    })?;
    table.register("uc", |_, args| unary(args, "uc", |v| v.to_text().to_uppercase()))?;
    table.register("lc", |_, args| unary(args, "lc", |v| v.to_text().to_lowercase()))?;
    table.register("trim", |_, args| unary(args, "trim", |v| v.to_text().trim().to_string()))?;
    table.register("size", |_, args| {
        arity(args, "size", 1, 1)?;
        Ok(DataTree::Int(args[0].size() as i64))
    })?;
    table.register("default", |_, args| {
        arity(args, "default", 2, 2)?;
        let value = &args[0];
        let missing = value.is_null() || value.as_str().is_some_and(str::is_empty);
        Ok(if missing { args[1].clone() } else { value.clone() })
    })?;
    table.register("defined", |_, args| {
        arity(args, "defined", 1, usize::MAX)?;
        Ok(DataTree::Bool(args.iter().all(|v| !v.is_null())))
    })?;
    table.register("numformat", |_, args| {
        arity(args, "numformat", 1, 4)?;
        num_format(args)
    })?;
    table.register("log", log)?;
    table.register("assign", assign)?;
    Ok(())
}

fn arity(args: &[DataTree], name: &str, min: usize, max: usize) -> Result<(), SyscallError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("at least {min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(SyscallError::new(format!(
            "{name} expects {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn unary(args: &[DataTree], name: &str, f: impl Fn(&DataTree) -> String) -> SyscallResult {
    arity(args, name, 1, 1)?;
    Ok(DataTree::String(f(&args[0])))
}

pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode everything except RFC 3986 unreserved characters.
pub fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Escape for embedding in a JavaScript string literal inside HTML.
pub fn js_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '&' => out.push_str("\\u0026"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// `numformat(value, [decimals], [thousands_sep], [decimal_point])`
fn num_format(args: &[DataTree]) -> SyscallResult {
    let decimals = match args.get(1) {
        None | Some(DataTree::Null) => None,
        Some(v) => match v.to_number() {
            Number::Int(n) if (0..=20).contains(&n) => Some(n as usize),
            _ => return Err(SyscallError::new("numformat: decimals must be 0..=20")),
        },
    };
    let sep = args.get(2).map(|v| v.to_text().into_owned()).unwrap_or_else(|| ",".to_string());
    let point = args.get(3).map(|v| v.to_text().into_owned()).unwrap_or_else(|| ".".to_string());

    let text = match (args[0].to_number(), decimals) {
        (Number::Int(n), None) => n.to_string(),
        (n, None) => format_float(n.as_f64()),
        (n, Some(d)) => format!("{:.*}", d, n.as_f64()),
    };
    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text.as_str()),
    };
    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3 * sep.len());
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push_str(&sep);
        }
        grouped.push(ch);
    }

    let mut out = format!("{sign}{grouped}");
    if let Some(frac) = frac_part {
        out.push_str(&point);
        out.push_str(frac);
    }
    Ok(DataTree::String(out))
}

/// `log(message, ...)`: write the arguments to the log at info level.
fn log(ctx: &mut SyscallContext<'_>, args: &[DataTree]) -> SyscallResult {
    let message: Vec<String> = args.iter().map(|v| v.to_text().into_owned()).collect();
    info!(ip = ctx.ip, "template log message: \"{}\"", message.join(" "));
    Ok(DataTree::Null)
}

/// `assign(name, value)`: set a top-level key of the request's data.
fn assign(ctx: &mut SyscallContext<'_>, args: &[DataTree]) -> SyscallResult {
    arity(args, "assign", 2, 2)?;
    let name = args[0].to_text().into_owned();
    if name.is_empty() {
        return Err(SyscallError::new("assign: empty variable name"));
    }
    if ctx.data.is_null() {
        *ctx.data = DataTree::empty_map();
    }
    let map = ctx
        .data
        .as_map_mut()
        .ok_or_else(|| SyscallError::new("assign: data root is not an object"))?;
    trace!(name = %name, "assign");
    map.insert(name, args[1].clone());
    Ok(DataTree::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[DataTree]) -> SyscallResult {
        let table = SyscallTable::stdlib(100).unwrap();
        let mut data = DataTree::Null;
        let mut ctx = SyscallContext {
            data: &mut data,
            ip: 0,
        };
        table.call(name, &mut ctx, args).unwrap()
    }

    fn text(name: &str, args: &[DataTree]) -> String {
        call(name, args).unwrap().to_text().into_owned()
    }

    #[test]
    fn test_escapes() {
        assert_eq!(
            text("htmlescape", &["<a href=\"x\">Tom & 'Jerry'</a>".into()]),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
        assert_eq!(text("urlescape", &["a b/c?d=é".into()]), "a%20b%2Fc%3Fd%3D%C3%A9");
        assert_eq!(text("jsescape", &["</script>\"\n".into()]), "\\u003C/script\\u003E\\\"\\n");
    }

    #[test]
    fn test_case_and_trim() {
        assert_eq!(text("uc", &["MixEd".into()]), "MIXED");
        assert_eq!(text("lc", &["MixEd".into()]), "mixed");
        assert_eq!(text("trim", &["  x y \n".into()]), "x y");
        assert_eq!(text("uc", &[DataTree::Int(5)]), "5");
    }

    #[test]
    fn test_json() {
        let mut map = crate::data::Map::new();
        map.insert("b".to_string(), DataTree::Int(1));
        map.insert("a".to_string(), DataTree::Array(vec![DataTree::Null, "x".into()]));
        assert_eq!(text("json", &[DataTree::Map(map)]), r#"{"b":1,"a":[null,"x"]}"#);
    }

    #[test]
    fn test_size_default_defined() {
        assert_eq!(call("size", &["héllo".into()]), Ok(DataTree::Int(5)));
        assert_eq!(call("default", &[DataTree::Null, "x".into()]), Ok("x".into()));
        assert_eq!(call("default", &["".into(), "x".into()]), Ok("x".into()));
        assert_eq!(call("default", &[DataTree::Int(0), "x".into()]), Ok(DataTree::Int(0)));
        assert_eq!(call("defined", &[DataTree::Int(1), "a".into()]), Ok(DataTree::Bool(true)));
        assert_eq!(call("defined", &[DataTree::Int(1), DataTree::Null]), Ok(DataTree::Bool(false)));
    }

    #[test]
    fn test_numformat() {
        assert_eq!(text("numformat", &[DataTree::Int(1234567)]), "1,234,567");
        assert_eq!(text("numformat", &[DataTree::Int(-1234)]), "-1,234");
        assert_eq!(text("numformat", &[DataTree::Int(999)]), "999");
        assert_eq!(
            text("numformat", &[DataTree::Float(1234.5), DataTree::Int(2)]),
            "1,234.50"
        );
        assert_eq!(
            text(
                "numformat",
                &[DataTree::Float(9876543.21), DataTree::Int(1), " ".into(), ",".into()]
            ),
            "9 876 543,2"
        );
        assert!(call("numformat", &[DataTree::Int(1), DataTree::Int(-1)]).is_err());
    }

    #[test]
    fn test_arity_errors() {
        let err = call("uc", &[]).unwrap_err();
        assert_eq!(err.to_string(), "uc expects 1 argument(s), got 0");
        let err = call("defined", &[]).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_assign_mutates_root() {
        let table = SyscallTable::stdlib(100).unwrap();
        let mut data = DataTree::empty_map();
        let mut ctx = SyscallContext {
            data: &mut data,
            ip: 7,
        };
        table
            .call("assign", &mut ctx, &["title".into(), "Home".into()])
            .unwrap()
            .unwrap();
        assert_eq!(data.lookup_path("title"), Some(&DataTree::from("Home")));

        let mut scalar = DataTree::Int(1);
        let mut ctx = SyscallContext {
            data: &mut scalar,
            ip: 7,
        };
        assert!(table.call("assign", &mut ctx, &["x".into(), DataTree::Null]).unwrap().is_err());
    }
}
