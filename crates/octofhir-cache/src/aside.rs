//! Cache-aside wrappers.
//!
//! ```ignore
//! let get_user = cache
//!     .memoize("user:{0}", |(id,): (u64,)| async move { repo.find_user(id).await })?
//!     .with_ttl(Duration::from_secs(60))
//!     .with_tags(["users"]);
//! let user: Option<User> = get_user.call((7,)).await?;
//!
//! let update_user = cache.invalidate_on_call(["users"], |user: User| async move {
//!     repo.save(user).await
//! });
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CacheError;
use crate::orchestrator::{CacheOrchestrator, EntryOptions, WriteStrategy};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Positional(usize),
    Named(String),
}

/// A parsed cache key template such as `user:{0}` or `tenant:{tenant}:user:{}`.
///
/// `{}` takes the next positional argument, `{N}` argument N and `{name}` a
/// named argument. `{{` and `}}` produce literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(template: &str) -> Result<Self, CacheError> {
        let invalid = |reason: String| CacheError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut next_auto = 0;
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(invalid("unmatched '}'".to_string())),
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for cc in chars.by_ref() {
                        if cc == '}' {
                            closed = true;
                            break;
                        }
                        name.push(cc);
                    }
                    if !closed {
                        return Err(invalid("unterminated placeholder".to_string()));
                    }

                    let segment = if name.is_empty() {
                        next_auto += 1;
                        Segment::Positional(next_auto - 1)
                    } else if name.chars().all(|ch| ch.is_ascii_digit()) {
                        let index = name
                            .parse()
                            .map_err(|_| invalid(format!("placeholder '{{{name}}}' is out of range")))?;
                        Segment::Positional(index)
                    } else if is_identifier(&name) {
                        Segment::Named(name)
                    } else {
                        return Err(invalid(format!("invalid placeholder '{{{name}}}'")));
                    };

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template contains any placeholder.
    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| !matches!(s, Segment::Literal(_)))
    }

    /// Build the concrete key. Fails if an argument is missing.
    pub fn render<A: KeyArgs + ?Sized>(&self, args: &A) -> Result<String, CacheError> {
        let mut key = String::with_capacity(self.source.len() + 16);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Positional(index) => {
                    let value = args
                        .positional(*index)
                        .ok_or_else(|| self.missing(index.to_string()))?;
                    key.push_str(&value);
                }
                Segment::Named(name) => {
                    let value = args.named(name).ok_or_else(|| self.missing(name.clone()))?;
                    key.push_str(&value);
                }
            }
        }
        Ok(key)
    }

    fn missing(&self, placeholder: String) -> CacheError {
        CacheError::MissingKeyArgument {
            template: self.source.clone(),
            placeholder,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Arguments a key template can draw from.
pub trait KeyArgs {
    fn positional(&self, index: usize) -> Option<String>;

    fn named(&self, _name: &str) -> Option<String> {
        None
    }
}

impl KeyArgs for () {
    fn positional(&self, _index: usize) -> Option<String> {
        None
    }
}

macro_rules! impl_key_args_for_tuple {
    ($($idx:tt $name:ident),+) => {
        impl<$($name: Display),+> KeyArgs for ($($name,)+) {
            fn positional(&self, index: usize) -> Option<String> {
                match index {
                    $($idx => Some(self.$idx.to_string()),)+
                    _ => None,
                }
            }
        }
    };
}

impl_key_args_for_tuple!(0 A);
impl_key_args_for_tuple!(0 A, 1 B);
impl_key_args_for_tuple!(0 A, 1 B, 2 C);
impl_key_args_for_tuple!(0 A, 1 B, 2 C, 3 D);

/// Positional and named arguments assembled at runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    positional: Vec<String>,
    named: HashMap<String, String>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Display) -> Self {
        self.positional.push(value.to_string());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.named.insert(name.into(), value.to_string());
        self
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(String::as_str)
    }

    pub fn get_named(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

impl KeyArgs for Args {
    fn positional(&self, index: usize) -> Option<String> {
        self.positional.get(index).cloned()
    }

    fn named(&self, name: &str) -> Option<String> {
        self.named.get(name).cloned()
    }
}

/// A read function whose results are cached under a templated key.
pub struct Memoized<F> {
    cache: Arc<CacheOrchestrator>,
    template: KeyTemplate,
    options: EntryOptions,
    func: F,
}

impl<F> Memoized<F> {
    pub(crate) fn new(cache: Arc<CacheOrchestrator>, template: KeyTemplate, func: F) -> Self {
        Self {
            cache,
            template,
            options: EntryOptions::default(),
            func,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = Some(ttl);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = self.options.with_tags(tags);
        self
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    /// Serve from cache, or call the wrapped function and cache its result.
    ///
    /// The key is rendered before anything else runs, so a missing argument
    /// fails without calling the function or touching the cache.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<Option<T>, E>
    where
        A: KeyArgs,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
    {
        let key = self.template.render(&args)?;
        self.cache
            .get_or_load(&key, self.options.clone(), || (self.func)(args))
            .await
    }
}

/// A write function that invalidates domains after it succeeds.
pub struct InvalidateOnCall<F> {
    cache: Arc<CacheOrchestrator>,
    domains: Vec<String>,
    func: F,
}

impl<F> InvalidateOnCall<F> {
    pub(crate) fn new(cache: Arc<CacheOrchestrator>, domains: Vec<String>, func: F) -> Self {
        Self {
            cache,
            domains,
            func,
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Run the wrapped function; on `Ok`, invalidate every domain. Errors
    /// leave the cache untouched.
    pub async fn call<A, T, E, Fut>(&self, args: A) -> Result<T, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let output = (self.func)(args).await?;
        for domain in &self.domains {
            self.cache.invalidate_pattern(domain).await;
        }
        Ok(output)
    }
}
