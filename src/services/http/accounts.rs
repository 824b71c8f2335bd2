use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use super::{respond, AppState, Caller};
use crate::{
    models::users::NewUser,
    services::{call, referrals::ReferralRequest, users::UserRequest},
};

pub async fn ensure_account(
    State(state): State<AppState>,
    Caller(identity): Caller,
    body: Option<Json<NewUser>>,
) -> impl IntoResponse {
    let referral_code = body.and_then(|Json(body)| body.referral_code);

    let result = call("UserService", &state.channels.users, |response| {
        UserRequest::EnsureAccount {
            identity,
            referral_code,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_account(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> impl IntoResponse {
    let result = call("UserService", &state.channels.users, |response| {
        UserRequest::GetAccount {
            user_id: identity.user_id,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn get_referrals(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> impl IntoResponse {
    let result = call("ReferralService", &state.channels.referrals, |response| {
        ReferralRequest::Summary {
            user_id: identity.user_id,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}
