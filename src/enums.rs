/// Reconstruction model a dataset was acquired for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Modality {
    Dti,
    Dsi,
}

/// Point-reduction policy applied when a streamline is appended.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub enum SavePolicy {
    /// Keep every point.
    All,
    /// Keep every other point, walked back to front; both endpoints survive.
    Half,
    /// Collapse runs of points that fall into the same voxel.
    #[default]
    Unique,
}
