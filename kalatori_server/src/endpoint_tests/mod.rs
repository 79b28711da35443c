mod helpers;
mod orders;
mod status;
