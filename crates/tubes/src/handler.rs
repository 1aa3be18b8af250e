mod commands;
mod local;
mod session;
