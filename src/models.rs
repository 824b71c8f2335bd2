pub mod payments;
pub mod referrals;
pub mod users;
pub mod withdrawals;
