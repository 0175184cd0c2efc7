pub mod error;
pub mod tensor;
pub mod tape;
pub mod traced;
pub mod state;
pub mod path;
pub mod field;
pub mod registry;
pub mod compat;
pub mod adapter;
pub mod solver;
pub(crate) mod adjoint;
pub mod cdeint;

pub use adapter::{Coupling, VectorFieldAdapter};
pub use cdeint::{cdeint, cdeint_with, CdeOptions, Diagnostic, Diagnostics, Solution};
pub use error::{CdeError, CdeResult};
pub use field::{FieldCapabilities, VectorField};
pub use path::{ControlPath, PathCapabilities};
pub use registry::ParameterRegistry;
pub use solver::{Method, OdeFunc, OdeIntegrator, RungeKutta, SolveStats, SolverOptions, Trajectory};
pub use state::{State, StructuralMode};
pub use tape::{BoundaryMarker, BufId, Tape};
