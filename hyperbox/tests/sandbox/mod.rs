mod agent;
mod driver;
mod lifecycle;
