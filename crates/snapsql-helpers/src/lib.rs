use std::hash::BuildHasherDefault;

pub type IndexMap<K, V> = indexmap::IndexMap<K, V, BuildHasherDefault<ahash::AHasher>>;
pub type IndexSet<V> = indexmap::IndexSet<V, BuildHasherDefault<ahash::AHasher>>;

/// Lets a value be built with a closure instead of a multi-field literal.
///
/// ```
/// use snapsql_helpers::Config;
///
/// #[derive(Default)]
/// struct Point { x: i32, y: i32 }
///
/// let p = Point::default().config(|p| { p.x = 1; p.y = 2; });
/// assert_eq!((p.x, p.y), (1, 2));
/// ```
pub trait Config: Sized {
    fn config(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self
    }
}

impl<T> Config for T {}
