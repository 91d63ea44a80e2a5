pub mod operator;
pub mod vnfs;
