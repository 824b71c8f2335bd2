use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use super::{respond, AppState, Caller};
use crate::{
    models::withdrawals::{DecisionBody, WithdrawalBody},
    services::{admin::AdminRequest, call, withdrawals::WithdrawalServiceRequest},
};

pub async fn request_withdrawal(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(body): Json<WithdrawalBody>,
) -> impl IntoResponse {
    let result = call(
        "WithdrawalService",
        &state.channels.withdrawals,
        |response| WithdrawalServiceRequest::Request {
            user_id: identity.user_id,
            amount: body.amount,
            payment_method: body.payment_method,
            payment_details: body.payment_details,
            response,
        },
    )
    .await;

    respond(StatusCode::CREATED, result)
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> impl IntoResponse {
    let result = call(
        "WithdrawalService",
        &state.channels.withdrawals,
        |response| WithdrawalServiceRequest::List {
            user_id: identity.user_id,
            response,
        },
    )
    .await;

    respond(StatusCode::OK, result)
}

pub async fn admin_list_withdrawals(
    State(state): State<AppState>,
    Caller(identity): Caller,
) -> impl IntoResponse {
    let result = call("AdminService", &state.channels.admin, |response| {
        AdminRequest::ListWithdrawals {
            caller_id: identity.user_id,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}

pub async fn admin_decide_withdrawal(
    State(state): State<AppState>,
    Caller(identity): Caller,
    Json(body): Json<DecisionBody>,
) -> impl IntoResponse {
    let result = call("AdminService", &state.channels.admin, |response| {
        AdminRequest::DecideWithdrawal {
            caller_id: identity.user_id,
            id: body.id,
            decision: body.status,
            admin_notes: body.admin_notes,
            response,
        }
    })
    .await;

    respond(StatusCode::OK, result)
}
