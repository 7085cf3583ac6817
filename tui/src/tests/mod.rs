//! Test modules for the terminal front end
