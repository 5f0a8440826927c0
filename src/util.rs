//! Small allocation helpers.

/// Allocates an array of length `LEN` in the heap, avoiding the stack roundtrip of
/// `Box::new([elem; LEN])`.
pub fn boxed_array<T: Clone, const LEN: usize>(elem: T) -> Box<[T; LEN]> {
    let boxed: Box<[T]> = vec![elem; LEN].into_boxed_slice();
    boxed.try_into().ok().unwrap()
}
