mod scenarios;
mod utils;
