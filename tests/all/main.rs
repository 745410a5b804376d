mod consumers;
mod dispatcher;
mod rabbitmq;
