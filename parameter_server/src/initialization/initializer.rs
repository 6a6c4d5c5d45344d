/// An `Initializer` fills the values of a table row the first time it's touched.
pub trait Initializer: Send + Sync {
    /// Overwrites `out` with the initial values of row `row_id`.
    ///
    /// # Arguments
    /// * `row_id` - The id of the row being materialized.
    /// * `out` - The row values, its length is the table dimension.
    fn fill(&self, row_id: u64, out: &mut [f32]);
}
