use std::borrow::Cow;
use std::fmt::{self, Write as _};

/// Pre-escaped HTML that is sent to the client verbatim.
///
/// A `Markup` value is never produced from arbitrary text without going
/// through [`Markup::escape`] or the [`markup!`](crate::markup!) macro,
/// except through the explicit [`Markup::trusted`] constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Markup(String);

impl Markup {
    /// Wraps HTML the caller vouches for. No escaping is applied.
    pub fn trusted(html: impl Into<String>) -> Self {
        Markup(html.into())
    }

    /// Escapes `text` so it renders literally, inside element content or a
    /// quoted attribute.
    pub fn escape(text: &str) -> Self {
        Markup(html_escape::encode_quoted_attribute(text).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends an interpolated value, escaping it unless it is markup.
    pub fn push<T: Interpolate + ?Sized>(&mut self, value: &T) {
        value.write_escaped(&mut self.0);
    }
}

impl fmt::Display for Markup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Markup> for String {
    fn from(markup: Markup) -> Self {
        markup.0
    }
}

/// A value that can be spliced into markup.
///
/// Text is escaped on the way in; `Markup` is inserted as-is so fragments
/// compose without double escaping.
pub trait Interpolate {
    fn write_escaped(&self, out: &mut String);
}

impl Interpolate for str {
    fn write_escaped(&self, out: &mut String) {
        out.push_str(&html_escape::encode_quoted_attribute(self));
    }
}

impl Interpolate for String {
    fn write_escaped(&self, out: &mut String) {
        self.as_str().write_escaped(out)
    }
}

impl Interpolate for Cow<'_, str> {
    fn write_escaped(&self, out: &mut String) {
        self.as_ref().write_escaped(out)
    }
}

impl Interpolate for char {
    fn write_escaped(&self, out: &mut String) {
        let mut buf = [0u8; 4];
        self.encode_utf8(&mut buf).write_escaped(out)
    }
}

impl Interpolate for Markup {
    fn write_escaped(&self, out: &mut String) {
        out.push_str(&self.0)
    }
}

impl<T: Interpolate> Interpolate for Option<T> {
    fn write_escaped(&self, out: &mut String) {
        if let Some(value) = self {
            value.write_escaped(out)
        }
    }
}

impl<T: Interpolate + ?Sized> Interpolate for &T {
    fn write_escaped(&self, out: &mut String) {
        (**self).write_escaped(out)
    }
}

macro_rules! interpolate_display {
    ($($ty:ty),*) => {
        $(impl Interpolate for $ty {
            fn write_escaped(&self, out: &mut String) {
                let _ = write!(out, "{}", self);
            }
        })*
    };
}

interpolate_display!(bool, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

/// Adapter used by [`markup!`](crate::markup!) to route each argument
/// through [`Interpolate`].
pub struct Escaped<'a, T: ?Sized>(pub &'a T);

impl<T: Interpolate + ?Sized> fmt::Display for Escaped<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.0.write_escaped(&mut out);
        f.write_str(&out)
    }
}

/// Builds [`Markup`] from a format string, escaping every positional
/// argument that is not itself markup.
///
/// Only positional arguments are escaped. Identifiers captured inline
/// (`{name}`) bypass escaping and must not be used.
///
/// ```ignore
/// let page = markup!("<p>Query parameter was: {}</p>", user_input);
/// ```
#[macro_export]
macro_rules! markup {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::markup::Markup::trusted(::std::format!(
            $fmt $(, $crate::markup::Escaped(&$arg))*
        ))
    };
}
