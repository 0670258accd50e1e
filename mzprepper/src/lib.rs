mod args;
mod driver;

pub use args::{default_params_template, parse_input_spec, InputSpec};
pub use driver::{MzPrepper, MzPrepperError, PARAMS_TEMPLATE_FILE};
