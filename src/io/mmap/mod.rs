mod arena;
pub use arena::Arena;

pub(crate) mod stream;
pub use stream::Stream;
