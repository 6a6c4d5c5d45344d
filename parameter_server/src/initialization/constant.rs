use super::Initializer;

/// An initializer that always fills rows with the same value.
#[derive(Debug)]
pub struct ConstInitializer {
    value: f32,
}

impl ConstInitializer {
    /// Creates a new `ConstInitializer`.
    ///
    /// # Arguments
    /// * `value` - The value every row element starts with.
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Initializer for ConstInitializer {
    fn fill(&self, _row_id: u64, out: &mut [f32]) {
        out.fill(self.value);
    }
}
