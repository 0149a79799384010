pub use crate::error::{Error, Result};
pub(crate) use crate::error::{ensure_config, ensure_data, ensure_usage};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use log::{debug, info};
pub use ndarray::{s, Array3, Array4, ArrayD, ArrayViewD, Axis, Ix4};
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fmt,
    fmt::Debug,
    fs::File,
    io,
    path::{Path, PathBuf},
    str::FromStr,
};
