/// Words a receive buffer is made of, any plain numeric type.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}

/// Words at least 4 bytes wide, a buffer of them can hold an `f32` payload viewed in place.
pub trait Align4: Align1 {}

impl Align4 for u32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
